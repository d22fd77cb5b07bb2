//! Node configuration.
//!
//! Constructed from [`Default`], then overridden by an optional TOML file,
//! then by CLI flags - each layer only overwriting fields it actually sets.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level node configuration, covering identity, mesh behavior, BLE
/// transport, sessions, delivery tracking, and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity-related settings.
    pub identity: IdentityConfig,
    /// Mesh routing behavior.
    pub mesh: MeshConfig,
    /// BLE transport settings.
    pub ble: BleConfig,
    /// Session and handshake tuning.
    pub session: SessionConfig,
    /// Delivery-tracking timeouts and retry policy.
    pub delivery: DeliveryConfig,
    /// Retry queue bounds.
    pub retry_queue: RetryQueueConfig,
    /// Logging verbosity.
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            mesh: MeshConfig::default(),
            ble: BleConfig::default(),
            session: SessionConfig::default(),
            delivery: DeliveryConfig::default(),
            retry_queue: RetryQueueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Identity configuration: display nickname and where long-term keys persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Nickname advertised in `Announce` packets.
    pub nickname: String,
    /// Where the encrypted long-term identity is stored, if persisted.
    pub store_path: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            store_path: None,
        }
    }
}

/// Mesh routing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// How long packet timestamps are accepted relative to local clock.
    #[serde(with = "duration_secs")]
    pub replay_window: Duration,
    /// Cover-traffic generation settings.
    pub cover_traffic: CoverTrafficConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            replay_window: Duration::from_secs(300),
            cover_traffic: CoverTrafficConfig::default(),
        }
    }
}

/// Cover traffic generation: periodic encrypted filler sent to a random peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverTrafficConfig {
    /// Whether cover traffic is generated at all.
    pub enabled: bool,
    /// Minimum interval between cover messages.
    #[serde(with = "duration_secs")]
    pub min_interval: Duration,
    /// Maximum interval between cover messages.
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
    /// Below this battery percentage, cover traffic is suppressed.
    pub suppress_below_battery_pct: u8,
}

impl Default for CoverTrafficConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(120),
            suppress_below_battery_pct: 20,
        }
    }
}

/// Battery-aware duty-cycle scan/advertise profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerMode {
    /// Maximum responsiveness, highest power draw.
    Performance,
    /// Default tradeoff.
    Balanced,
    /// Reduced duty cycle to conserve battery.
    PowerSaver,
    /// Minimal duty cycle for critical battery levels.
    UltraLow,
}

impl Default for PowerMode {
    fn default() -> Self {
        Self::Balanced
    }
}

/// BLE transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Current power/duty-cycle profile.
    pub power_mode: PowerMode,
    /// Maximum simultaneous connections, indexed by [`PowerMode`] ordinal.
    pub max_connections_by_mode: [usize; 4],
    /// Peripherals weaker than this RSSI (dBm) are ignored during scan.
    pub scan_rssi_floor_dbm: i16,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            power_mode: PowerMode::default(),
            max_connections_by_mode: [20, 10, 5, 2],
            scan_rssi_floor_dbm: -90,
        }
    }
}

/// Session and handshake tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rekey after this much wall-clock time.
    #[serde(with = "duration_secs")]
    pub rekey_after: Duration,
    /// Rekey after this many transport messages.
    pub rekey_after_messages: u64,
    /// Suppress a repeat handshake attempt within this window.
    #[serde(with = "duration_secs")]
    pub handshake_retry_suppress: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_after: Duration::from_secs(60 * 60),
            rekey_after_messages: 10_000,
            handshake_retry_suppress: Duration::from_secs(5),
        }
    }
}

/// Delivery-tracking timeouts and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Timeout for a private message.
    #[serde(with = "duration_secs")]
    pub private_timeout: Duration,
    /// Timeout for a channel message.
    #[serde(with = "duration_secs")]
    pub channel_timeout: Duration,
    /// Timeout for a private message to a favorite (retried).
    #[serde(with = "duration_secs")]
    pub favorite_timeout: Duration,
    /// Maximum retry attempts for a favorite.
    pub max_retries: u8,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            private_timeout: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(60),
            favorite_timeout: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

/// Retry queue bounds for sends that reached zero recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryQueueConfig {
    /// Maximum number of held packets.
    pub max_entries: usize,
    /// Interval between retry attempts.
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    /// Maximum attempts before a packet is dropped.
    pub max_attempts: u8,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            retry_interval: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// Logging verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level emitted.
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

/// Log levels, matching `tracing`'s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warn level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Render as the string `tracing_subscriber`'s `EnvFilter` expects.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl NodeConfig {
    /// Parse a config from TOML text, falling back to defaults for any
    /// field the file doesn't set.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or doesn't match the
    /// shape of `NodeConfig`.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
