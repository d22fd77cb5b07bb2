//! Fuzz test for peer-id hex encoding/decoding
//!
//! Tests that arbitrary input doesn't cause panics when parsed as peer IDs.
//! BitChat peer-ids are 8 bytes (16 hex chars), not the 32-byte identifiers
//! used elsewhere in the corpus.

#![no_main]

use libfuzzer_sys::fuzz_target;
use bitchat_core::PeerId;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = hex::decode(s);
        let _ = hex::decode(s.to_lowercase());
        let _ = hex::decode(s.to_uppercase());

        if s.len() == 16 {
            if let Ok(bytes) = hex::decode(s) {
                assert_eq!(bytes.len(), 8, "16 hex chars should decode to 8 bytes");
            }
        }
    }

    if data.len() == 8 {
        let bytes: [u8; 8] = data.try_into().unwrap();
        let peer_id = PeerId::from_bytes(bytes);

        let hex_str = peer_id.to_hex();
        assert_eq!(hex_str.len(), 16, "8 bytes should encode to 16 hex chars");

        let decoded = hex::decode(&hex_str).unwrap();
        assert_eq!(decoded.as_slice(), &peer_id.as_bytes());
    }
});
