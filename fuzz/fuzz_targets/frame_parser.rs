//! Fuzz target for wire packet parsing
//!
//! Tests that the packet parser correctly handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use bitchat_core::Packet;

fuzz_target!(|data: &[u8]| {
    // The parser should never panic, only return Ok or Err.
    if let Ok(packet) = Packet::parse(data) {
        // A packet that parsed successfully must re-encode without panicking.
        let _ = packet.encode();
        let _ = packet.ttl();
        let _ = packet.recipient_id();
    }

    // Also exercise the size-bounded entry point relays use on inbound data.
    let _ = Packet::parse_with_limit(data, 512);
});
