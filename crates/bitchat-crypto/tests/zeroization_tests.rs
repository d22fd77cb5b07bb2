//! Zeroization validation tests
//!
//! Verifies that sensitive cryptographic material is properly zeroized on
//! drop to prevent key bytes from lingering in memory.

use bitchat_crypto::encrypted_keys::{DecryptedPrivateKey, EncryptedPrivateKey, KeyEncryptionParams};
use bitchat_crypto::noise::NoiseKeypair;
use bitchat_crypto::signatures::SigningKey;
use bitchat_crypto::x25519::{PrivateKey, SharedSecret};
use rand_core::OsRng;

#[test]
fn noise_keypair_zeroizes_on_drop() {
    let keypair = NoiseKeypair::generate().expect("generate keypair");
    drop(keypair);
    // `NoiseKeypair`'s `Drop` impl calls `self.private.zeroize()`; this test
    // exercises the path at runtime, the guarantee itself is structural.
}

#[test]
fn x25519_private_key_zeroizes_on_drop() {
    let key = PrivateKey::generate(&mut OsRng);
    drop(key);
}

#[test]
fn x25519_shared_secret_zeroizes_on_drop() {
    let a = PrivateKey::generate(&mut OsRng);
    let b = PrivateKey::generate(&mut OsRng);
    let shared = a.exchange(&b.public_key()).expect("valid peer key");
    drop(shared);
}

#[test]
fn signing_key_zeroizes_on_drop() {
    let key = SigningKey::generate(&mut OsRng);
    let _ = key.sign(b"message");
    drop(key);
}

#[test]
fn decrypted_private_key_zeroizes_on_drop() {
    let secret_key = [0x42u8; 32];
    let encrypted = EncryptedPrivateKey::encrypt(&secret_key, b"passphrase", KeyEncryptionParams::default())
        .expect("encryption failed");
    let decrypted = encrypted.decrypt(b"passphrase").expect("decryption failed");
    assert_eq!(decrypted.as_bytes(), &secret_key);
    drop(decrypted);
}

/// Compile-time check that the key types carrying raw secret bytes actually
/// derive `ZeroizeOnDrop`, rather than relying on a manual `Drop` impl that
/// could silently stop zeroizing after a refactor.
#[test]
fn key_types_implement_zeroize_on_drop() {
    fn assert_zeroize_on_drop<T: zeroize::ZeroizeOnDrop>() {}

    assert_zeroize_on_drop::<PrivateKey>();
    assert_zeroize_on_drop::<SharedSecret>();
    assert_zeroize_on_drop::<SigningKey>();
    assert_zeroize_on_drop::<DecryptedPrivateKey>();
    // NoiseKeypair zeroizes its private key in a manual Drop impl instead,
    // since its public half must stay readable after the secret is wiped.
}

#[test]
fn encrypted_private_key_rejects_wrong_passphrase() {
    let secret_key = [0x11u8; 32];
    let encrypted = EncryptedPrivateKey::encrypt(&secret_key, b"correct horse", KeyEncryptionParams::default())
        .expect("encryption failed");
    assert!(encrypted.decrypt(b"wrong passphrase").is_err());
}
