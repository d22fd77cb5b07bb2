//! Fuzz target for cryptographic input handling
//!
//! Tests that the Noise handshake reader and Ed25519 signature verifier
//! correctly reject arbitrary/adversarial input without panicking.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use bitchat_crypto::noise::{NoiseHandshake, NoiseKeypair};
use bitchat_crypto::signatures::{Signature, SigningKey};

#[derive(Debug, Arbitrary)]
struct CryptoInput {
    handshake_bytes: Vec<u8>,
    message: Vec<u8>,
    signature: [u8; 64],
}

fuzz_target!(|input: CryptoInput| {
    // A fresh responder fed attacker-controlled bytes as the first
    // handshake message must only ever return an error, never panic.
    let Ok(keypair) = NoiseKeypair::generate() else {
        return;
    };
    if let Ok(mut responder) = NoiseHandshake::new_responder(&keypair) {
        let _ = responder.read_message(&input.handshake_bytes);
    }

    // Signature verification over arbitrary bytes must also only error.
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let verifying_key = signing_key.verifying_key();
    let signature = Signature::from_bytes(input.signature);
    let _ = verifying_key.verify(&input.message, &signature);
});
