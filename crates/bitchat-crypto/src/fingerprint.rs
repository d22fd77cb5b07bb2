//! Stable peer identity derived from a static X25519 public key.
//!
//! A fingerprint is the lowercase hex of the SHA-256 digest of a peer's long-lived
//! static Noise DH public key. Unlike the ephemeral peer-id, it does not change
//! across rotations and is the key under which sessions and favorites are tracked.

use sha2::{Digest, Sha256};

/// SHA-256 digest of a static DH public key, 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a static X25519 public key.
    #[must_use]
    pub fn of(static_public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(static_public_key);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Reconstruct a fingerprint from its raw 32-byte digest, e.g. one
    /// carried over the wire rather than computed locally from a public key.
    #[must_use]
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, the form used in logs and UI.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
