//! Error types for the BitChat mesh protocol.

use thiserror::Error;

/// Top-level mesh protocol error.
#[derive(Debug, Error)]
pub enum Error {
    /// Packet codec error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Router error.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// Cryptographic error.
    #[error("crypto error: {0}")]
    Crypto(#[from] bitchat_crypto::CryptoError),
}

/// Packet codec errors.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Packet too short or structurally inconsistent.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Declared payload length exceeds the configured maximum.
    #[error("payload too large: {size} exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Unsupported protocol version.
    #[error("version incompatible: peer speaks {peer}, we speak {ours}")]
    VersionIncompatible {
        /// Version advertised by the peer.
        peer: u8,
        /// Version we support.
        ours: u8,
    },
}

/// Fragment reassembly and session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No Noise session exists for this peer.
    #[error("unknown session for peer")]
    UnknownSession,

    /// Noise handshake failed or was rejected.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake did not complete within the configured timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Decryption of an incoming transport message failed.
    #[error("decrypt failed")]
    DecryptFailed,

    /// Per-direction nonce counter is exhausted; session must rekey.
    #[error("nonce exhausted, rekey required")]
    NonceExhausted,

    /// Too many concurrent fragment reassemblies in flight.
    #[error("fragment reassembly overflow")]
    FragmentOverflow,
}

/// Mesh routing and delivery errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Packet was dropped because it has already been seen.
    #[error("duplicate packet")]
    DuplicatePacket,

    /// Packet fell outside the accepted replay window.
    #[error("outside replay window")]
    ReplayWindow,

    /// No route (direct or relay) exists to the destination peer.
    #[error("no route to peer")]
    NoRoute,

    /// Caller or peer exceeded its configured rate limit.
    #[error("rate limited")]
    RateLimited,

    /// The underlying transport failed to write the frame.
    #[error("transport write failed: {0}")]
    TransportWriteFailed(String),
}
