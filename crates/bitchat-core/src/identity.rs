//! Long-term node identity, ephemeral peer-id rotation, and signed identity bindings.
//!
//! A node has one long-term identity (an X25519 static Noise keypair plus an
//! Ed25519 signing key, fingerprinted by [`Fingerprint`]) and a rotating
//! short-lived peer-id used on the wire so that passive observers cannot
//! trivially track a device across sessions.

use std::time::{SystemTime, UNIX_EPOCH};

use bitchat_crypto::noise::NoiseKeypair;
use bitchat_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use bitchat_crypto::{CryptoError, Fingerprint};

use crate::packet::PEER_ID_SIZE;

/// How long a peer-id stays current before rotation, absent jitter.
pub const ROTATION_INTERVAL_MIN: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Upper bound of the rotation interval (1-6h, per the jitter window).
pub const ROTATION_INTERVAL_MAX: std::time::Duration = std::time::Duration::from_secs(6 * 60 * 60);

/// How long a previous peer-id is still accepted as "ours" after rotation.
pub const ROTATION_GRACE: std::time::Duration = std::time::Duration::from_secs(60);

/// An ephemeral 8-byte peer identifier, rendered as 16 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Wrap raw bytes as a peer-id.
    #[must_use]
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> [u8; PEER_ID_SIZE] {
        self.0
    }

    /// Lowercase 16-hex-char rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Generate a new peer-id: 8 bytes of CSPRNG with the low-order 32 bits of
    /// the current wall-clock millisecond count XORed into the last 4 bytes.
    ///
    /// This is deliberate uniqueness insurance against a weak or repeating
    /// RNG, not a secret input - the timestamp is public and coarse. It must
    /// not be replaced with pure CSPRNG output.
    fn generate() -> Result<Self, CryptoError> {
        let mut bytes = bitchat_crypto::random::random_8()?;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u32;
        for (b, t) in bytes[4..8].iter_mut().zip(now_ms.to_be_bytes()) {
            *b ^= t;
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Signed binding of a long-term fingerprint to the sender's current peer-id.
///
/// Broadcast on bootstrap, on peer subscribe, on rotation, and after a
/// completed handshake, so the rest of the mesh can follow a peer across
/// peer-id rotations without losing the Noise session tied to its fingerprint.
#[derive(Clone)]
pub struct IdentityAnnounce {
    /// The peer-id this binding claims.
    pub peer_id: PeerId,
    /// The long-term static public key the binding is signed with.
    pub signing_public_key: VerifyingKey,
    /// The announcer's Noise static DH public key. Fingerprinting this is
    /// what ties the binding to a session's key, not the ephemeral peer-id.
    pub static_public_key: [u8; 32],
    /// Fingerprint of `static_public_key`.
    pub fingerprint: Fingerprint,
    /// Display nickname at the time of announcing.
    pub nickname: String,
    /// Milliseconds since the Unix epoch when this binding was signed.
    pub timestamp: u64,
    /// Ed25519 signature over `peer_id || static_public_key || timestamp`.
    pub signature: Signature,
}

impl IdentityAnnounce {
    fn signed_bytes(peer_id: &PeerId, static_public_key: &[u8; 32], timestamp: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PEER_ID_SIZE + 32 + 8);
        buf.extend_from_slice(&peer_id.as_bytes());
        buf.extend_from_slice(static_public_key);
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf
    }

    /// Produce a binding for `peer_id`/`fingerprint`/`nickname`, signed by
    /// `signing_key` with the current wall-clock timestamp.
    #[must_use]
    pub fn sign(
        peer_id: PeerId,
        fingerprint: Fingerprint,
        static_public_key: [u8; 32],
        nickname: String,
        signing_key: &SigningKey,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let message = Self::signed_bytes(&peer_id, &static_public_key, timestamp);
        let signature = signing_key.sign(&message);
        Self {
            peer_id,
            signing_public_key: signing_key.verifying_key(),
            static_public_key,
            fingerprint,
            nickname,
            timestamp,
            signature,
        }
    }

    /// Verify the binding's signature against its carried public key.
    ///
    /// This is genuine Ed25519 verification with no bypass: a binding whose
    /// signature does not verify must be dropped exactly like a malformed
    /// packet, never accepted "for compatibility."
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidSignature` if verification fails.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let message = Self::signed_bytes(&self.peer_id, &self.static_public_key, self.timestamp);
        self.signing_public_key.verify(&message, &self.signature)
    }
}

/// This node's long-term identity plus its current rotation state.
pub struct RotatingIdentity {
    static_keypair: NoiseKeypair,
    signing_key: SigningKey,
    fingerprint: Fingerprint,
    current: PeerId,
    previous: Option<(PeerId, std::time::Instant)>,
    rotated_at: std::time::Instant,
}

impl RotatingIdentity {
    /// Generate a brand-new long-term identity and initial peer-id.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or peer-id generation fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let static_keypair = NoiseKeypair::generate()?;
        let signing_key = SigningKey::generate(&mut rand_core::OsRng);
        let fingerprint = Fingerprint::of(static_keypair.public_key());
        let current = PeerId::generate()?;

        Ok(Self {
            static_keypair,
            signing_key,
            fingerprint,
            current,
            previous: None,
            rotated_at: std::time::Instant::now(),
        })
    }

    /// Restore an identity from persisted long-term key material.
    ///
    /// # Errors
    ///
    /// Returns an error if peer-id generation fails.
    pub fn from_keys(static_keypair: NoiseKeypair, signing_key: SigningKey) -> Result<Self, CryptoError> {
        let fingerprint = Fingerprint::of(static_keypair.public_key());
        let current = PeerId::generate()?;
        Ok(Self {
            static_keypair,
            signing_key,
            fingerprint,
            current,
            previous: None,
            rotated_at: std::time::Instant::now(),
        })
    }

    /// The long-term Noise static keypair.
    #[must_use]
    pub fn static_keypair(&self) -> &NoiseKeypair {
        &self.static_keypair
    }

    /// The Ed25519 signing key.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Fingerprint of the static Noise public key. Stable across rotations.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The peer-id currently advertised on the wire.
    #[must_use]
    pub fn current_peer_id(&self) -> PeerId {
        self.current
    }

    /// Whether `id` is accepted as belonging to this node: the current
    /// peer-id, or the previous one within the 60 s grace window.
    #[must_use]
    pub fn is_ours(&self, id: PeerId) -> bool {
        if id == self.current {
            return true;
        }
        match self.previous {
            Some((prev, at)) => id == prev && at.elapsed() < ROTATION_GRACE,
            None => false,
        }
    }

    /// Whether the peer-id is due for rotation, given the rotation interval
    /// chosen at last rotation (1-6h with jitter, supplied by the caller).
    #[must_use]
    pub fn is_rotation_due(&self, interval: std::time::Duration) -> bool {
        self.rotated_at.elapsed() >= interval
    }

    /// Rotate to a new peer-id, remembering the old one for the grace window.
    ///
    /// Callers must not invoke this while any session is mid-handshake;
    /// that gate lives in the session manager, not here.
    ///
    /// # Errors
    ///
    /// Returns an error if peer-id generation fails.
    pub fn rotate(&mut self) -> Result<(), CryptoError> {
        let new_id = PeerId::generate()?;
        self.previous = Some((self.current, std::time::Instant::now()));
        self.current = new_id;
        self.rotated_at = std::time::Instant::now();
        Ok(())
    }

    /// Produce a freshly signed `IdentityAnnounce` for the current peer-id.
    #[must_use]
    pub fn announce(&self, nickname: &str) -> IdentityAnnounce {
        IdentityAnnounce::sign(
            self.current,
            self.fingerprint,
            *self.static_keypair.public_key(),
            nickname.to_string(),
            &self.signing_key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_are_unique() {
        let a = PeerId::generate().unwrap();
        let b = PeerId::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn peer_id_hex_is_16_chars() {
        let id = PeerId::generate().unwrap();
        assert_eq!(id.to_hex().len(), 16);
    }

    #[test]
    fn identity_generation_produces_stable_fingerprint() {
        let identity = RotatingIdentity::generate().unwrap();
        let fp1 = identity.fingerprint();
        let fp2 = identity.fingerprint();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn rotation_keeps_previous_id_in_grace_window() {
        let mut identity = RotatingIdentity::generate().unwrap();
        let old_id = identity.current_peer_id();

        identity.rotate().unwrap();
        let new_id = identity.current_peer_id();

        assert_ne!(old_id, new_id);
        assert!(identity.is_ours(old_id));
        assert!(identity.is_ours(new_id));
    }

    #[test]
    fn unrelated_id_is_not_ours() {
        let identity = RotatingIdentity::generate().unwrap();
        let unrelated = PeerId::generate().unwrap();
        assert!(!identity.is_ours(unrelated));
    }

    #[test]
    fn identity_announce_roundtrips_and_verifies() {
        let identity = RotatingIdentity::generate().unwrap();
        let announce = identity.announce("alice");

        assert_eq!(announce.peer_id, identity.current_peer_id());
        assert_eq!(announce.fingerprint, identity.fingerprint());
        assert_eq!(announce.nickname, "alice");
        announce.verify().expect("genuine signature must verify");
    }

    #[test]
    fn tampered_identity_announce_fails_verification() {
        let identity = RotatingIdentity::generate().unwrap();
        let mut announce = identity.announce("alice");
        announce.peer_id = PeerId::generate().unwrap();

        assert!(announce.verify().is_err());
    }

    #[test]
    fn replayed_timestamp_does_not_change_signature_validity_but_is_stale() {
        let identity = RotatingIdentity::generate().unwrap();
        let mut announce = identity.announce("alice");
        let original_timestamp = announce.timestamp;
        announce.timestamp = original_timestamp.saturating_sub(10 * 60 * 1000);

        assert!(announce.verify().is_err());
    }

    #[test]
    fn rotation_due_check_respects_interval() {
        let identity = RotatingIdentity::generate().unwrap();
        assert!(!identity.is_rotation_due(std::time::Duration::from_secs(3600)));
        assert!(identity.is_rotation_due(std::time::Duration::from_secs(0)));
    }
}
