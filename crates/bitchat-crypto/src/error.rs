//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure).
    #[error("decrypt failed: authentication failure")]
    DecryptFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Invalid public key encoding.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid signature encoding or verification failure.
    #[error("invalid signature")]
    InvalidSignature,

    /// Noise handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake message received while the session was not in a state to accept it.
    #[error("session not established")]
    SessionNotEstablished,

    /// Random number generation failed.
    #[error("random number generation failed")]
    RandomFailed,

    /// Nonce counter exhausted; caller must rekey.
    #[error("nonce counter exhausted, rekey required")]
    NonceExhausted,

    /// Password-based key unwrap failed (wrong password or corrupted store).
    #[error("key store unwrap failed")]
    KeyUnwrapFailed,

    /// Argon2id key-derivation parameters are out of range or the KDF itself failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Caller-supplied parameter failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Stored key material is truncated, malformed, or carries an unknown format version.
    #[error("invalid key material")]
    InvalidKeyMaterial,
}

impl From<snow::Error> for CryptoError {
    fn from(e: snow::Error) -> Self {
        match e {
            snow::Error::Decrypt => CryptoError::DecryptFailed,
            other => CryptoError::HandshakeFailed(other.to_string()),
        }
    }
}
