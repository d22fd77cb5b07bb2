//! Per-peer Noise session state.
//!
//! A session is owned exclusively by the [`crate::session_manager::SessionManager`]
//! that created it and is keyed by the remote peer's [`Fingerprint`], not its
//! ephemeral peer-id - the fingerprint is the only thing that survives a
//! peer-id rotation.

use std::time::{Duration, Instant};

use bitchat_crypto::Fingerprint;
use bitchat_crypto::noise::{HandshakePhase, NoiseHandshake, NoiseKeypair, NoiseTransport, Role};

use crate::error::SessionError;

/// Rekey after this much wall-clock time has elapsed since the last handshake.
pub const REKEY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Rekey after this many transport messages have been sent.
pub const REKEY_AFTER_MESSAGES: u64 = 10_000;

/// State machine of a per-peer session.
pub enum SessionState {
    /// No handshake has been attempted yet.
    None,
    /// A Noise `XX` handshake is in progress.
    Handshaking {
        /// Our role in this handshake.
        role: Role,
        /// Current handshake step.
        phase: HandshakePhase,
    },
    /// The transport is up and ready to encrypt/decrypt application data.
    Established {
        /// Noise transport-mode cipher pair (send + receive).
        transport: Box<NoiseTransport>,
        /// Remote peer's static Noise public key, fixed for the life of the session.
        remote_static_public_key: [u8; 32],
    },
}

/// A Noise session with one remote peer, identified by fingerprint.
pub struct Session {
    fingerprint: Fingerprint,
    state: SessionState,
    handshake: Option<NoiseHandshake>,
    created_at: Instant,
    messages_sent: u64,
    last_rekey: Instant,
}

impl Session {
    /// Create a fresh, unhandshaked session for `fingerprint`.
    #[must_use]
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            state: SessionState::None,
            handshake: None,
            created_at: Instant::now(),
            messages_sent: 0,
            last_rekey: Instant::now(),
        }
    }

    /// The remote peer's fingerprint. Stable for the life of this session.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Rekey the session's fingerprint binding once the real one is learned.
    ///
    /// Used by the session manager to promote a session accepted before the
    /// remote's static key (and therefore its real fingerprint) was known,
    /// to its true fingerprint once the handshake completes.
    pub(crate) fn rebind_fingerprint(&mut self, fingerprint: Fingerprint) {
        self.fingerprint = fingerprint;
    }

    /// Whether the transport is established and ready for application data.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established { .. })
    }

    /// Whether a handshake is currently in progress.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, SessionState::Handshaking { .. })
    }

    /// The remote static public key, once established.
    #[must_use]
    pub fn remote_static_public_key(&self) -> Option<[u8; 32]> {
        match &self.state {
            SessionState::Established {
                remote_static_public_key,
                ..
            } => Some(*remote_static_public_key),
            _ => None,
        }
    }

    /// Begin a handshake as initiator, returning the first Noise message to send.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::HandshakeFailed` if a Noise handshake object
    /// cannot be constructed.
    pub fn initiate(&mut self, local_keypair: &NoiseKeypair) -> Result<Vec<u8>, SessionError> {
        let mut handshake = NoiseHandshake::new_initiator(local_keypair)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        let msg = handshake
            .write_message(&[])
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        self.state = SessionState::Handshaking {
            role: Role::Initiator,
            phase: handshake.phase(),
        };
        self.handshake = Some(handshake);
        Ok(msg)
    }

    /// Accept the first handshake message as responder.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::HandshakeFailed` on a malformed or rejected message.
    pub fn accept(
        &mut self,
        local_keypair: &NoiseKeypair,
        msg: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let mut handshake = NoiseHandshake::new_responder(local_keypair)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        handshake
            .read_message(msg)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        let reply = handshake
            .write_message(&[])
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        self.state = SessionState::Handshaking {
            role: Role::Responder,
            phase: handshake.phase(),
        };
        self.handshake = Some(handshake);
        Ok(reply)
    }

    /// Feed the next handshake message in. Returns an outbound reply if the
    /// pattern calls for one, and completes the session once the final
    /// message has been processed.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::HandshakeFailed` if no handshake is in progress
    /// or the message is rejected by the Noise state machine.
    pub fn advance_handshake(&mut self, msg: &[u8]) -> Result<Option<Vec<u8>>, SessionError> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or_else(|| SessionError::HandshakeFailed("no handshake in progress".into()))?;

        handshake
            .read_message(msg)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        if handshake.is_complete() {
            return self.complete_handshake();
        }

        let reply = handshake
            .write_message(&[])
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        if handshake.is_complete() {
            self.complete_handshake()?;
            return Ok(Some(reply));
        }

        Ok(Some(reply))
    }

    fn complete_handshake(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let handshake = self.handshake.take().expect("handshake present");
        let remote_static_public_key = handshake
            .get_remote_static()
            .ok_or_else(|| SessionError::HandshakeFailed("missing remote static key".into()))?;
        let transport = handshake
            .into_transport()
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        self.state = SessionState::Established {
            transport: Box::new(transport),
            remote_static_public_key,
        };
        self.last_rekey = Instant::now();
        self.messages_sent = 0;
        Ok(None)
    }

    /// Encrypt `plaintext` for the established transport.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if not established, or maps
    /// through `NonceExhausted` once the send counter is exhausted.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let SessionState::Established { transport, .. } = &mut self.state else {
            return Err(SessionError::UnknownSession);
        };
        let ct = transport.write_message(plaintext).map_err(|e| {
            if matches!(e, bitchat_crypto::CryptoError::NonceExhausted) {
                SessionError::NonceExhausted
            } else {
                SessionError::HandshakeFailed(e.to_string())
            }
        })?;
        self.messages_sent += 1;
        Ok(ct)
    }

    /// Decrypt a transport-mode ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if not established, or
    /// `SessionError::DecryptFailed` on an authentication failure.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let SessionState::Established { transport, .. } = &mut self.state else {
            return Err(SessionError::UnknownSession);
        };
        transport
            .read_message(ciphertext)
            .map_err(|_| SessionError::DecryptFailed)
    }

    /// Whether this session should rekey: 1h elapsed or 10,000 messages sent.
    #[must_use]
    pub fn needs_rekey(&self) -> bool {
        self.is_established()
            && (self.last_rekey.elapsed() >= REKEY_AFTER
                || self.messages_sent >= REKEY_AFTER_MESSAGES)
    }

    /// Reset to a fresh pre-handshake state, keeping the fingerprint binding.
    ///
    /// Used both when a rekey re-initiates `XX` from scratch and when a
    /// session is migrated to a new peer-id.
    pub fn reset(&mut self) {
        self.state = SessionState::None;
        self.handshake = None;
    }

    /// Wall-clock age of this session.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint::of(&[0x42u8; 32])
    }

    #[test]
    fn fresh_session_is_not_established() {
        let session = Session::new(fp());
        assert!(!session.is_established());
        assert!(!session.is_handshaking());
    }

    #[test]
    fn full_handshake_establishes_session() {
        let initiator_keys = NoiseKeypair::generate().unwrap();
        let responder_keys = NoiseKeypair::generate().unwrap();

        let mut initiator = Session::new(fp());
        let mut responder = Session::new(fp());

        let msg1 = initiator.initiate(&initiator_keys).unwrap();
        let msg2 = responder.accept(&responder_keys, &msg1).unwrap();
        let msg3 = initiator.advance_handshake(&msg2).unwrap().unwrap();
        responder.advance_handshake(&msg3).unwrap();

        assert!(initiator.is_established());
        assert!(responder.is_established());
    }

    #[test]
    fn established_session_encrypts_and_decrypts() {
        let initiator_keys = NoiseKeypair::generate().unwrap();
        let responder_keys = NoiseKeypair::generate().unwrap();

        let mut initiator = Session::new(fp());
        let mut responder = Session::new(fp());

        let msg1 = initiator.initiate(&initiator_keys).unwrap();
        let msg2 = responder.accept(&responder_keys, &msg1).unwrap();
        let msg3 = initiator.advance_handshake(&msg2).unwrap().unwrap();
        responder.advance_handshake(&msg3).unwrap();

        let ct = initiator.encrypt(b"hello").unwrap();
        let pt = responder.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn encrypt_before_established_fails() {
        let mut session = Session::new(fp());
        assert!(matches!(
            session.encrypt(b"x"),
            Err(SessionError::UnknownSession)
        ));
    }

    #[test]
    fn rekey_not_needed_for_fresh_session() {
        let initiator_keys = NoiseKeypair::generate().unwrap();
        let responder_keys = NoiseKeypair::generate().unwrap();

        let mut initiator = Session::new(fp());
        let mut responder = Session::new(fp());
        let msg1 = initiator.initiate(&initiator_keys).unwrap();
        let msg2 = responder.accept(&responder_keys, &msg1).unwrap();
        initiator.advance_handshake(&msg2).unwrap();

        assert!(!initiator.needs_rekey());
    }
}
