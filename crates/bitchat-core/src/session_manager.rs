//! Maps the mesh's current peer-ids onto long-lived, fingerprint-keyed sessions.
//!
//! A session survives its owning peer's id rotation: lookups happen by
//! [`Fingerprint`], while a secondary table tracks which peer-id currently
//! maps to which fingerprint so inbound packets (addressed by peer-id) can
//! find their session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitchat_crypto::Fingerprint;
use bitchat_crypto::noise::NoiseKeypair;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::identity::PeerId;
use crate::session::Session;

/// A second handshake attempt for the same peer within this window is suppressed.
pub const HANDSHAKE_RETRY_SUPPRESS: Duration = Duration::from_secs(5);

/// Tracks all active per-peer Noise sessions and the peer-id bindings that route to them.
pub struct SessionManager {
    local_keypair: Arc<NoiseKeypair>,
    sessions: DashMap<Fingerprint, Arc<Mutex<Session>>>,
    peer_id_to_fingerprint: DashMap<PeerId, Fingerprint>,
    last_handshake_attempt: DashMap<Fingerprint, Instant>,
}

impl SessionManager {
    /// Create a manager bound to this node's long-term Noise keypair.
    #[must_use]
    pub fn new(local_keypair: Arc<NoiseKeypair>) -> Self {
        Self {
            local_keypair,
            sessions: DashMap::new(),
            peer_id_to_fingerprint: DashMap::new(),
            last_handshake_attempt: DashMap::new(),
        }
    }

    /// Resolve a peer-id to its bound fingerprint, if one has been learned.
    #[must_use]
    pub fn fingerprint_for(&self, peer_id: PeerId) -> Option<Fingerprint> {
        self.peer_id_to_fingerprint.get(&peer_id).map(|r| *r)
    }

    /// Record (or update) which fingerprint a peer-id currently binds to.
    pub fn bind(&self, peer_id: PeerId, fingerprint: Fingerprint) {
        self.peer_id_to_fingerprint.insert(peer_id, fingerprint);
    }

    /// Tie-break rule for simultaneous handshakes: the lexicographically
    /// smaller peer-id initiates; the other side waits and re-announces.
    #[must_use]
    pub fn should_initiate(our_peer_id: PeerId, their_peer_id: PeerId) -> bool {
        our_peer_id < their_peer_id
    }

    /// Temporary key a responder uses for a session before the Noise `XX`
    /// handshake reveals the initiator's real static key and fingerprint.
    ///
    /// `XX` hides the initiator's identity until message 3, so an inbound
    /// `NoiseHandshakeInit` can only be keyed by the sender's ephemeral
    /// peer-id until the handshake completes.
    #[must_use]
    pub fn temp_fingerprint_for(peer_id: PeerId) -> Fingerprint {
        let mut seed = [0u8; 32];
        seed[..crate::packet::PEER_ID_SIZE].copy_from_slice(&peer_id.as_bytes());
        Fingerprint::of(&seed)
    }

    fn get_or_create(&self, fingerprint: Fingerprint) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(fingerprint))))
            .clone()
    }

    fn handshake_suppressed(&self, fingerprint: Fingerprint) -> bool {
        self.last_handshake_attempt
            .get(&fingerprint)
            .is_some_and(|at| at.elapsed() < HANDSHAKE_RETRY_SUPPRESS)
    }

    /// Begin a handshake with `fingerprint` as initiator.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::HandshakeFailed` if a second attempt is made
    /// within the suppression window, or the handshake itself fails to start.
    pub async fn initiate(&self, fingerprint: Fingerprint) -> Result<Vec<u8>, SessionError> {
        if self.handshake_suppressed(fingerprint) {
            return Err(SessionError::HandshakeFailed(
                "handshake attempt suppressed".into(),
            ));
        }
        self.last_handshake_attempt.insert(fingerprint, Instant::now());

        let session = self.get_or_create(fingerprint);
        let mut guard = session.lock().await;
        guard.initiate(&self.local_keypair)
    }

    /// Accept an inbound handshake-initiation message for `fingerprint`.
    ///
    /// # Errors
    ///
    /// Propagates `SessionError::HandshakeFailed` from the underlying Noise state machine.
    pub async fn accept(&self, fingerprint: Fingerprint, msg: &[u8]) -> Result<Vec<u8>, SessionError> {
        let session = self.get_or_create(fingerprint);
        let mut guard = session.lock().await;
        guard.accept(&self.local_keypair, msg)
    }

    /// Feed a subsequent handshake message (msg2/msg3) into an in-progress handshake.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if no session exists for the fingerprint.
    pub async fn advance_handshake(
        &self,
        fingerprint: Fingerprint,
        msg: &[u8],
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let session = self
            .sessions
            .get(&fingerprint)
            .map(|s| s.clone())
            .ok_or(SessionError::UnknownSession)?;
        let mut guard = session.lock().await;
        guard.advance_handshake(msg)
    }

    /// Encrypt application data for an established session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if no session exists or it isn't established.
    pub async fn encrypt(&self, fingerprint: Fingerprint, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let session = self
            .sessions
            .get(&fingerprint)
            .map(|s| s.clone())
            .ok_or(SessionError::UnknownSession)?;
        let mut guard = session.lock().await;
        guard.encrypt(plaintext)
    }

    /// Decrypt a transport-mode ciphertext from an established session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if no session exists or it isn't established.
    pub async fn decrypt(&self, fingerprint: Fingerprint, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let session = self
            .sessions
            .get(&fingerprint)
            .map(|s| s.clone())
            .ok_or(SessionError::UnknownSession)?;
        let mut guard = session.lock().await;
        guard.decrypt(ciphertext)
    }

    /// Re-initiate the Noise `XX` handshake for a session due for rekey.
    ///
    /// The old session remains usable until the new one reaches
    /// `Established`; callers swap traffic over only at that point.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if no session exists for the fingerprint.
    pub async fn rekey(&self, fingerprint: Fingerprint) -> Result<Vec<u8>, SessionError> {
        let session = self
            .sessions
            .get(&fingerprint)
            .map(|s| s.clone())
            .ok_or(SessionError::UnknownSession)?;
        let mut guard = session.lock().await;
        guard.reset();
        guard.initiate(&self.local_keypair)
    }

    /// Whether any tracked session is mid-handshake right now.
    ///
    /// Peer-id rotation must be deferred while this is true.
    pub async fn any_handshaking(&self) -> bool {
        for entry in &self.sessions {
            if entry.value().lock().await.is_handshaking() {
                return true;
            }
        }
        false
    }

    /// Promote a session keyed by a [`Self::temp_fingerprint_for`] placeholder
    /// to its real fingerprint, once the handshake that completed it reveals
    /// the remote's static key. Binds `peer_id` to the real fingerprint too.
    ///
    /// Returns the real fingerprint, or `None` if no session was keyed under
    /// `temp_fingerprint` or it isn't established yet.
    pub async fn rebind_to_fingerprint(
        &self,
        temp_fingerprint: Fingerprint,
        peer_id: PeerId,
    ) -> Option<Fingerprint> {
        let (_, session) = self.sessions.remove(&temp_fingerprint)?;
        let real_fingerprint = {
            let mut guard = session.lock().await;
            let remote_key = guard.remote_static_public_key()?;
            let real = Fingerprint::of(&remote_key);
            guard.rebind_fingerprint(real);
            real
        };

        self.sessions.insert(real_fingerprint, session);
        self.peer_id_to_fingerprint.insert(peer_id, real_fingerprint);
        Some(real_fingerprint)
    }

    /// Repoint a binding from an old peer-id to a new one for the same fingerprint.
    ///
    /// Called when an `IdentityAnnounce` for a known fingerprint arrives
    /// carrying a different peer-id than the one currently on file. The
    /// session itself (keyed by fingerprint) is untouched.
    pub fn migrate(&self, old_peer_id: PeerId, new_peer_id: PeerId, fingerprint: Fingerprint) {
        self.peer_id_to_fingerprint.remove(&old_peer_id);
        self.peer_id_to_fingerprint.insert(new_peer_id, fingerprint);
    }

    /// Drop a session and its peer-id bindings entirely.
    pub fn remove(&self, fingerprint: Fingerprint) {
        self.sessions.remove(&fingerprint);
        self.peer_id_to_fingerprint
            .retain(|_, fp| *fp != fingerprint);
    }

    /// Number of active sessions, for Bloom-filter sizing and diagnostics.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> Arc<NoiseKeypair> {
        Arc::new(NoiseKeypair::generate().unwrap())
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::of(&[byte; 32])
    }

    #[tokio::test]
    async fn full_handshake_through_manager() {
        let initiator = SessionManager::new(keypair());
        let responder = SessionManager::new(keypair());
        let fingerprint = fp(1);

        let msg1 = initiator.initiate(fingerprint).await.unwrap();
        let msg2 = responder.accept(fingerprint, &msg1).await.unwrap();
        let msg3 = initiator
            .advance_handshake(fingerprint, &msg2)
            .await
            .unwrap()
            .unwrap();
        responder.advance_handshake(fingerprint, &msg3).await.unwrap();

        let ct = initiator.encrypt(fingerprint, b"hi").await.unwrap();
        let pt = responder.decrypt(fingerprint, &ct).await.unwrap();
        assert_eq!(pt, b"hi");
    }

    #[tokio::test]
    async fn second_initiate_within_window_is_suppressed() {
        let manager = SessionManager::new(keypair());
        let fingerprint = fp(2);

        manager.initiate(fingerprint).await.unwrap();
        let second = manager.initiate(fingerprint).await;
        assert!(second.is_err());
    }

    #[test]
    fn tie_break_prefers_smaller_peer_id() {
        let a = PeerId::from_bytes([0u8; 8]);
        let b = PeerId::from_bytes([1u8; 8]);
        assert!(SessionManager::should_initiate(a, b));
        assert!(!SessionManager::should_initiate(b, a));
    }

    #[test]
    fn migrate_repoints_binding_without_touching_session() {
        let manager = SessionManager::new(keypair());
        let old_id = PeerId::from_bytes([1u8; 8]);
        let new_id = PeerId::from_bytes([2u8; 8]);
        let fingerprint = fp(3);

        manager.bind(old_id, fingerprint);
        manager.migrate(old_id, new_id, fingerprint);

        assert_eq!(manager.fingerprint_for(old_id), None);
        assert_eq!(manager.fingerprint_for(new_id), Some(fingerprint));
    }

    #[tokio::test]
    async fn rebind_promotes_temp_keyed_session_to_real_fingerprint() {
        let initiator = SessionManager::new(keypair());
        let responder = SessionManager::new(keypair());
        let initiator_peer_id = PeerId::from_bytes([1u8; 8]);
        let temp_fp = SessionManager::temp_fingerprint_for(initiator_peer_id);

        let msg1 = initiator.initiate(fp(1)).await.unwrap();
        let msg2 = responder.accept(temp_fp, &msg1).await.unwrap();
        let msg3 = initiator
            .advance_handshake(fp(1), &msg2)
            .await
            .unwrap()
            .unwrap();
        responder.advance_handshake(temp_fp, &msg3).await.unwrap();

        let real_fp = responder
            .rebind_to_fingerprint(temp_fp, initiator_peer_id)
            .await
            .expect("established session promotes");

        assert_eq!(responder.fingerprint_for(initiator_peer_id), Some(real_fp));
        assert!(responder.sessions.get(&temp_fp).is_none());
    }

    #[tokio::test]
    async fn remove_drops_session_and_bindings() {
        let manager = SessionManager::new(keypair());
        let peer_id = PeerId::from_bytes([5u8; 8]);
        let fingerprint = fp(4);

        manager.bind(peer_id, fingerprint);
        manager.initiate(fingerprint).await.unwrap();
        assert_eq!(manager.session_count(), 1);

        manager.remove(fingerprint);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.fingerprint_for(peer_id), None);
    }
}
