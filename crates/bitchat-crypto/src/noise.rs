//! Noise_XX handshake for mutual authentication between two BitChat peers.
//!
//! Implements the Noise_XX pattern using the `snow` library:
//! - Pattern: `XX` (mutual authentication, identity hiding)
//! - DH: `25519` (Curve25519)
//! - Cipher: `ChaChaPoly` (ChaCha20-Poly1305)
//! - Hash: `SHA256`
//!
//! ## Message Flow
//!
//! ```text
//! Message 1: Initiator → Responder: e
//! Message 2: Responder → Initiator: e, ee, s, es
//! Message 3: Initiator → Responder: s, se
//! ```
//!
//! After message 3, both parties have authenticated each other's static keys and
//! hold two independent transport cipher states with 64-bit, monotonically
//! incrementing nonces per direction. `snow`'s transport mode already enforces
//! strict sequential receive nonces, so no gap-tolerant replay bookkeeping is
//! layered on top here.

use crate::CryptoError;
use snow::{Builder, HandshakeState, TransportState};
use zeroize::Zeroize;

/// Noise protocol pattern used by BitChat.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Maximum handshake message size. Message 2 (e + s + 2 tags) is the largest at
/// 96 bytes; rounded up with headroom for any payload carried alongside it.
const MAX_HANDSHAKE_MSG_SIZE: usize = 256;

/// Role in the Noise handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (sends message 1).
    Initiator,
    /// Responds to handshake (receives message 1).
    Responder,
}

/// State of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initial state, ready to start.
    Initial,
    /// After message 1 (initiator sent, responder received).
    Message1Complete,
    /// After message 2 (responder sent, initiator received).
    Message2Complete,
    /// Handshake complete, transport ready.
    Complete,
}

/// Static keypair for Noise handshakes.
///
/// This is the long-term identity key used across multiple sessions, distinct
/// from the Ed25519 signing key used for `IdentityAnnounce` authentication.
pub struct NoiseKeypair {
    private: Vec<u8>,
    public: [u8; 32],
}

impl NoiseKeypair {
    /// Generate a new random keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if the Noise pattern fails to parse or keypair generation
    /// fails due to RNG issues.
    pub fn generate() -> Result<Self, CryptoError> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(|e: snow::Error| {
            CryptoError::HandshakeFailed(format!("pattern parse error: {e}"))
        })?);

        let keypair = builder
            .generate_keypair()
            .map_err(|e| CryptoError::HandshakeFailed(format!("keypair generation: {e}")))?;

        let mut public = [0u8; 32];
        public.copy_from_slice(&keypair.public);

        Ok(Self {
            private: keypair.private,
            public,
        })
    }

    /// Create from an existing 32-byte X25519 private key.
    #[must_use]
    pub fn from_bytes(private: [u8; 32]) -> Self {
        use crate::x25519::PrivateKey;

        let x25519_private = PrivateKey::from_bytes(private);
        let public = x25519_private.public_key().to_bytes();

        Self {
            private: private.to_vec(),
            public,
        }
    }

    /// Public key bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Private key bytes.
    ///
    /// # Security
    ///
    /// This is the long-term identity key; handle with care.
    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.private
    }
}

impl Drop for NoiseKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl Clone for NoiseKeypair {
    fn clone(&self) -> Self {
        Self {
            private: self.private.clone(),
            public: self.public,
        }
    }
}

/// Noise_XX handshake in progress.
pub struct NoiseHandshake {
    state: HandshakeState,
    role: Role,
    phase: HandshakePhase,
}

impl NoiseHandshake {
    /// Start a handshake as the initiator (sends message 1 first).
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern fails to parse or the handshake state
    /// cannot be built from the local key.
    pub fn new_initiator(local_keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(|e: snow::Error| {
            CryptoError::HandshakeFailed(format!("pattern parse error: {e}"))
        })?);

        let state = builder
            .local_private_key(&local_keypair.private)
            .map_err(|e| CryptoError::HandshakeFailed(format!("key error: {e}")))?
            .build_initiator()
            .map_err(|e| CryptoError::HandshakeFailed(format!("build error: {e}")))?;

        Ok(Self {
            state,
            role: Role::Initiator,
            phase: HandshakePhase::Initial,
        })
    }

    /// Start a handshake as the responder (waits for message 1).
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern fails to parse or the handshake state
    /// cannot be built from the local key.
    pub fn new_responder(local_keypair: &NoiseKeypair) -> Result<Self, CryptoError> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(|e: snow::Error| {
            CryptoError::HandshakeFailed(format!("pattern parse error: {e}"))
        })?);

        let state = builder
            .local_private_key(&local_keypair.private)
            .map_err(|e| CryptoError::HandshakeFailed(format!("key error: {e}")))?
            .build_responder()
            .map_err(|e| CryptoError::HandshakeFailed(format!("build error: {e}")))?;

        Ok(Self {
            state,
            role: Role::Responder,
            phase: HandshakePhase::Initial,
        })
    }

    /// Current handshake phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Role this handshake was created with.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// True once the 3-message exchange has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Write the next handshake message to send to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionNotEstablished`] if called out of turn for
    /// this role/phase, or a handshake error if `snow` rejects the operation.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::Initial | HandshakePhase::Message2Complete)
            | (Role::Responder, HandshakePhase::Message1Complete) => {}
            _ => return Err(CryptoError::SessionNotEstablished),
        }

        let mut message = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.write_message(payload, &mut message)?;
        message.truncate(len);

        self.phase = match self.phase {
            HandshakePhase::Initial => HandshakePhase::Message1Complete,
            HandshakePhase::Message1Complete => HandshakePhase::Message2Complete,
            HandshakePhase::Message2Complete | HandshakePhase::Complete => HandshakePhase::Complete,
        };

        Ok(message)
    }

    /// Read the next handshake message from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionNotEstablished`] if called out of turn, or
    /// [`CryptoError::DecryptFailed`] if the message fails authentication.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match (self.role, self.phase) {
            (Role::Responder, HandshakePhase::Initial | HandshakePhase::Message2Complete)
            | (Role::Initiator, HandshakePhase::Message1Complete) => {}
            _ => return Err(CryptoError::SessionNotEstablished),
        }

        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.read_message(message, &mut payload)?;
        payload.truncate(len);

        self.phase = match self.phase {
            HandshakePhase::Initial => HandshakePhase::Message1Complete,
            HandshakePhase::Message1Complete => HandshakePhase::Message2Complete,
            HandshakePhase::Message2Complete | HandshakePhase::Complete => HandshakePhase::Complete,
        };

        Ok(payload)
    }

    /// The peer's static public key, available once it has been transmitted (message 2 or 3).
    #[must_use]
    pub fn get_remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|key| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(key);
            arr
        })
    }

    /// Complete the handshake and transition to transport mode.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionNotEstablished`] if the handshake has not
    /// finished all three messages.
    pub fn into_transport(self) -> Result<NoiseTransport, CryptoError> {
        if self.phase != HandshakePhase::Complete {
            return Err(CryptoError::SessionNotEstablished);
        }

        let transport = self.state.into_transport_mode()?;
        Ok(NoiseTransport {
            transport,
            role: self.role,
        })
    }
}

/// Post-handshake transport cipher pair, one direction per peer.
pub struct NoiseTransport {
    transport: TransportState,
    role: Role,
}

impl NoiseTransport {
    /// Encrypt and authenticate a plaintext payload for sending.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceExhausted`] if the 64-bit send nonce has been
    /// exhausted (the caller must rekey before sending further messages).
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut message = vec![0u8; payload.len() + 16];
        let len = self.transport.write_message(payload, &mut message).map_err(|e| {
            if matches!(e, snow::Error::Decrypt) {
                CryptoError::NonceExhausted
            } else {
                CryptoError::from(e)
            }
        })?;
        message.truncate(len);
        Ok(message)
    }

    /// Decrypt and authenticate a received message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptFailed`] if authentication fails or the
    /// receive nonce does not match the next expected value.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.len() < 16 {
            return Err(CryptoError::DecryptFailed);
        }
        let mut payload = vec![0u8; message.len() - 16];
        let len = self.transport.read_message(message, &mut payload)?;
        payload.truncate(len);
        Ok(payload)
    }

    /// Role this transport was created with.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Re-key the sending cipher, as part of a scheduled full re-handshake this
    /// transport is being retired in favor of.
    pub fn rekey_send(&mut self) {
        self.transport.rekey_outgoing();
    }

    /// Re-key the receiving cipher.
    pub fn rekey_recv(&mut self) {
        self.transport.rekey_incoming();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let keypair = NoiseKeypair::generate().unwrap();
        assert_ne!(keypair.public_key(), &[0u8; 32]);
    }

    #[test]
    fn test_keypair_from_bytes() {
        let original = NoiseKeypair::generate().unwrap();
        let mut private_bytes = [0u8; 32];
        private_bytes.copy_from_slice(original.private_key());

        let restored = NoiseKeypair::from_bytes(private_bytes);
        assert_eq!(original.public_key(), restored.public_key());
    }

    fn complete_handshake() -> (NoiseHandshake, NoiseHandshake, NoiseKeypair, NoiseKeypair) {
        let initiator_keypair = NoiseKeypair::generate().unwrap();
        let responder_keypair = NoiseKeypair::generate().unwrap();

        let mut initiator = NoiseHandshake::new_initiator(&initiator_keypair).unwrap();
        let mut responder = NoiseHandshake::new_responder(&responder_keypair).unwrap();

        let msg1 = initiator.write_message(&[]).unwrap();
        responder.read_message(&msg1).unwrap();

        let msg2 = responder.write_message(&[]).unwrap();
        initiator.read_message(&msg2).unwrap();

        let msg3 = initiator.write_message(&[]).unwrap();
        responder.read_message(&msg3).unwrap();

        (initiator, responder, initiator_keypair, responder_keypair)
    }

    #[test]
    fn test_full_handshake() {
        let (initiator, responder, initiator_keypair, responder_keypair) = complete_handshake();
        assert!(initiator.is_complete());
        assert!(responder.is_complete());
        assert_eq!(
            initiator.get_remote_static().unwrap(),
            *responder_keypair.public_key()
        );
        assert_eq!(
            responder.get_remote_static().unwrap(),
            *initiator_keypair.public_key()
        );
    }

    #[test]
    fn test_handshake_with_payloads() {
        let initiator_keypair = NoiseKeypair::generate().unwrap();
        let responder_keypair = NoiseKeypair::generate().unwrap();

        let mut initiator = NoiseHandshake::new_initiator(&initiator_keypair).unwrap();
        let mut responder = NoiseHandshake::new_responder(&responder_keypair).unwrap();

        let payload1 = b"hello from initiator";
        let msg1 = initiator.write_message(payload1).unwrap();
        assert_eq!(responder.read_message(&msg1).unwrap(), payload1);

        let payload2 = b"hello from responder";
        let msg2 = responder.write_message(payload2).unwrap();
        assert_eq!(initiator.read_message(&msg2).unwrap(), payload2);

        let payload3 = b"final message";
        let msg3 = initiator.write_message(payload3).unwrap();
        assert_eq!(responder.read_message(&msg3).unwrap(), payload3);
    }

    #[test]
    fn test_transport_encryption() {
        let (initiator, responder, _, _) = complete_handshake();
        let mut initiator_transport = initiator.into_transport().unwrap();
        let mut responder_transport = responder.into_transport().unwrap();

        let plaintext1 = b"secret message from initiator";
        let ciphertext1 = initiator_transport.write_message(plaintext1).unwrap();
        assert_eq!(responder_transport.read_message(&ciphertext1).unwrap(), plaintext1);

        let plaintext2 = b"secret message from responder";
        let ciphertext2 = responder_transport.write_message(plaintext2).unwrap();
        assert_eq!(initiator_transport.read_message(&ciphertext2).unwrap(), plaintext2);
    }

    #[test]
    fn test_invalid_state_errors() {
        let keypair = NoiseKeypair::generate().unwrap();

        let mut initiator = NoiseHandshake::new_initiator(&keypair).unwrap();
        assert!(initiator.read_message(&[0u8; 32]).is_err());

        let mut responder = NoiseHandshake::new_responder(&keypair).unwrap();
        assert!(responder.write_message(&[]).is_err());
    }

    #[test]
    fn test_transport_rekey() {
        let (initiator, responder, _, _) = complete_handshake();
        let mut initiator_transport = initiator.into_transport().unwrap();
        let mut responder_transport = responder.into_transport().unwrap();

        let msg_before = b"before rekey";
        let ct1 = initiator_transport.write_message(msg_before).unwrap();
        assert_eq!(responder_transport.read_message(&ct1).unwrap(), msg_before);

        initiator_transport.rekey_send();
        responder_transport.rekey_recv();

        let msg_after = b"after rekey";
        let ct2 = initiator_transport.write_message(msg_after).unwrap();
        assert_eq!(responder_transport.read_message(&ct2).unwrap(), msg_after);
    }

    #[test]
    fn test_tampered_ciphertext_fails_to_decrypt() {
        let (initiator, responder, _, _) = complete_handshake();
        let mut initiator_transport = initiator.into_transport().unwrap();
        let mut responder_transport = responder.into_transport().unwrap();

        let mut ct = initiator_transport.write_message(b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;

        assert!(responder_transport.read_message(&ct).is_err());
    }
}
