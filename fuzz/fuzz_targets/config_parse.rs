//! Fuzz test for configuration file parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics or crashes when
//! parsed as BitChat node configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use bitchat_core::NodeConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        // Deserializing as NodeConfig will fail for invalid configs, but
        // must never panic - this is the same path bitchat-cli's
        // `config::load_or_default` runs on a user-supplied file.
        let _ = NodeConfig::from_toml_str(s);
    }
});
