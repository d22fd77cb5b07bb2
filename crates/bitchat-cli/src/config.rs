//! Configuration loading for the BitChat CLI.
//!
//! Thin wrapper over [`bitchat_core::NodeConfig`]: the core owns every
//! tunable, this module only owns where the file lives on disk.

use std::fs;
use std::path::{Path, PathBuf};

use bitchat_core::NodeConfig;

/// Load a [`NodeConfig`] from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse as valid
/// configuration TOML.
pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<NodeConfig> {
    let contents = fs::read_to_string(path)?;
    Ok(NodeConfig::from_toml_str(&contents)?)
}

/// Write `config` to `path` as pretty TOML, creating parent directories as
/// needed.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save<P: AsRef<Path>>(config: &NodeConfig, path: P) -> anyhow::Result<()> {
    let contents = toml::to_string_pretty(config)?;
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Default config file location, `$XDG_CONFIG_HOME/bitchat/config.toml`.
#[must_use]
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("bitchat/config.toml")
}

/// Default identity key-store location, next to the config file.
#[must_use]
pub fn default_identity_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("bitchat/identity.enc")
}

/// Default control-socket path for the running daemon.
#[must_use]
pub fn default_control_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("bitchat.sock")
}

/// Load the config at `path` if it exists, else write and return the
/// default.
///
/// # Errors
///
/// Returns an error if reading, parsing, or writing the default fails.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<NodeConfig> {
    let path = path.as_ref();
    if path.exists() {
        load(path)
    } else {
        let config = NodeConfig::default();
        save(&config, path)?;
        Ok(config)
    }
}
