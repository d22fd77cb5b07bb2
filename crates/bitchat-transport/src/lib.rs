//! # BitChat Transport
//!
//! BLE transport layer for BitChat: a dual-role (central + peripheral)
//! Bluetooth Low Energy implementation of [`bitchat_core::BleBackend`].
//!
//! This crate provides:
//! - [`central`]: `btleplug`-based scanning, connecting, and GATT writes
//! - [`peripheral`]: `bluer`-based local GATT server and advertising (Linux only)
//! - [`pool`]: connection bookkeeping, exponential backoff, and UUID-to-peer-id binding
//!
//! Everything above the GATT boundary - packet framing, sessions, routing -
//! lives in `bitchat-core` and is transport-agnostic; this crate's only job
//! is moving opaque bytes between peers over the air.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod central;
pub mod pool;

#[cfg(target_os = "linux")]
pub mod peripheral;

use uuid::Uuid;

/// BitChat BLE service UUID, advertised by every peripheral role node.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B_5E2D_4A9E_4C5A_9B3F_8E1D_2C3A_4B5C);

/// Single GATT characteristic used for both directions of traffic: writes
/// carry packets from central to peripheral, notifications carry packets
/// from peripheral to central.
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xA1B2_C3D4_E5F6_4A5B_8C9D_0E1F_2A3B_4C5D);

/// Conservative BLE write MTU. Payloads above this are fragmented by
/// `bitchat-core` before reaching this crate.
pub const BLE_MTU: usize = 244;

/// Transport-layer configuration shared by the central and peripheral roles.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum time to wait for a scan to discover a target peer.
    pub scan_timeout: std::time::Duration,
    /// Maximum time to wait for a GATT connection to complete.
    pub connection_timeout: std::time::Duration,
    /// Whether to automatically retry a dropped connection with backoff.
    pub auto_reconnect: bool,
    /// Peripherals weaker than this RSSI (dBm) are ignored during scan.
    pub scan_rssi_floor_dbm: i16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout: std::time::Duration::from_secs(10),
            connection_timeout: std::time::Duration::from_secs(5),
            auto_reconnect: true,
            scan_rssi_floor_dbm: -90,
        }
    }
}
