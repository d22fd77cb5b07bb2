//! # BitChat Crypto
//!
//! Cryptographic primitives for the BitChat mesh protocol.
//!
//! This crate provides:
//! - `Noise_XX` handshake for mutual authentication and forward secrecy
//! - Transport-mode AEAD encryption with monotonic per-direction nonces
//! - Ed25519 identity signing, independent of the Noise static DH key
//! - SHA-256 fingerprinting of static DH public keys
//! - Secure random number generation
//! - Password-based private key encryption (Argon2id + XChaCha20-Poly1305)
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Noise Pattern | `Noise_XX_25519_ChaChaPoly_SHA256` | 128-bit |
//! | Transport AEAD | `ChaCha20-Poly1305` | 256-bit key |
//! | Fingerprint | SHA-256 | 128-bit collision |
//! | Signatures | Ed25519 | 128-bit |
//! | Key Encryption | Argon2id + `XChaCha20-Poly1305` | 256-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod constant_time;
pub mod encrypted_keys;
pub mod error;
pub mod fingerprint;
pub mod noise;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
pub use fingerprint::Fingerprint;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// SHA-256 fingerprint size
pub const FINGERPRINT_SIZE: usize = 32;
