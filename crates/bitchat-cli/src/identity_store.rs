//! On-disk persistence for the long-term identity.
//!
//! [`bitchat_core::RotatingIdentity`] only holds keys in memory; this module
//! encrypts the Noise static key and the Ed25519 signing key at rest with
//! [`bitchat_crypto::encrypted_keys`], the same Argon2id + `XChaCha20-Poly1305`
//! scheme the crypto crate already provides for this purpose.

use std::fs;
use std::path::Path;

use bitchat_core::RotatingIdentity;
use bitchat_crypto::encrypted_keys::{EncryptedPrivateKey, KeyEncryptionParams};
use bitchat_crypto::noise::NoiseKeypair;
use bitchat_crypto::signatures::SigningKey;

/// Generate a fresh identity and write both keys to `path`, encrypted with
/// `passphrase`.
///
/// # Errors
///
/// Returns an error if key generation, encryption, or the write fails.
pub fn generate_and_save<P: AsRef<Path>>(
    path: P,
    passphrase: &[u8],
) -> anyhow::Result<RotatingIdentity> {
    let identity = RotatingIdentity::generate()?;
    save(path, &identity, passphrase)?;
    Ok(identity)
}

/// Write an existing identity's long-term keys to `path`, encrypted with
/// `passphrase`.
///
/// # Errors
///
/// Returns an error if encryption or the write fails.
pub fn save<P: AsRef<Path>>(
    path: P,
    identity: &RotatingIdentity,
    passphrase: &[u8],
) -> anyhow::Result<()> {
    let noise_private: [u8; 32] = identity
        .static_keypair()
        .private_key()
        .try_into()
        .expect("NoiseKeypair private key is always 32 bytes");
    let signing_bytes = identity.signing_key().to_bytes();

    let params = KeyEncryptionParams::default();
    let noise_blob =
        EncryptedPrivateKey::encrypt(&noise_private, passphrase, params)?.to_bytes();
    let signing_blob =
        EncryptedPrivateKey::encrypt(&signing_bytes, passphrase, params)?.to_bytes();

    let mut file = Vec::with_capacity(8 + noise_blob.len() + signing_blob.len());
    file.extend_from_slice(&(noise_blob.len() as u32).to_le_bytes());
    file.extend_from_slice(&noise_blob);
    file.extend_from_slice(&(signing_blob.len() as u32).to_le_bytes());
    file.extend_from_slice(&signing_blob);

    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, file)?;
    Ok(())
}

/// Load and decrypt the identity stored at `path`.
///
/// # Errors
///
/// Returns an error if the file is missing, malformed, or `passphrase` is
/// wrong.
pub fn load<P: AsRef<Path>>(path: P, passphrase: &[u8]) -> anyhow::Result<RotatingIdentity> {
    let bytes = fs::read(path)?;
    if bytes.len() < 8 {
        anyhow::bail!("identity file too short");
    }

    let noise_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let noise_start = 4;
    let noise_end = noise_start + noise_len;
    let signing_len_start = noise_end;
    let signing_len_end = signing_len_start + 4;
    if bytes.len() < signing_len_end {
        anyhow::bail!("identity file truncated");
    }
    let signing_len =
        u32::from_le_bytes(bytes[signing_len_start..signing_len_end].try_into().unwrap()) as usize;
    let signing_start = signing_len_end;
    let signing_end = signing_start + signing_len;
    if bytes.len() < signing_end {
        anyhow::bail!("identity file truncated");
    }

    let noise_blob = EncryptedPrivateKey::from_bytes(&bytes[noise_start..noise_end])?;
    let signing_blob = EncryptedPrivateKey::from_bytes(&bytes[signing_start..signing_end])?;

    let noise_private = noise_blob.decrypt(passphrase)?;
    let signing_private = signing_blob.decrypt(passphrase)?;

    let noise_keypair = NoiseKeypair::from_bytes(*noise_private.as_bytes());
    let signing_key = SigningKey::from_bytes(signing_private.as_bytes());

    Ok(RotatingIdentity::from_keys(noise_keypair, signing_key)?)
}

/// Load the identity at `path` if it exists, else generate and save a fresh
/// one.
///
/// # Errors
///
/// Returns an error if generation, loading, or saving fails.
pub fn load_or_generate<P: AsRef<Path>>(
    path: P,
    passphrase: &[u8],
) -> anyhow::Result<RotatingIdentity> {
    let path = path.as_ref();
    if path.exists() {
        load(path, passphrase)
    } else {
        generate_and_save(path, passphrase)
    }
}
