//! # BitChat Core
//!
//! Core mesh protocol implementation for BitChat: a peer-to-peer encrypted
//! chat protocol running over a Bluetooth Low Energy mesh, with no servers,
//! phone numbers, or accounts.
//!
//! This crate provides:
//! - **Packet codec**: binary wire format shared by every message type
//! - **Duplicate filter**: adaptive Bloom+exact-set replay suppression
//! - **Fragmentation**: split/reassemble payloads over BLE's small MTU
//! - **Noise `XX` sessions**: mutual authentication and forward secrecy per peer
//! - **Identity**: long-term fingerprint plus rotating, unlinkable peer-id
//! - **Mesh router**: relay decisions, store-and-forward, cover traffic
//! - **Delivery tracking and retry**: ack/read-receipt bookkeeping, bounded retry
//! - **Version negotiation**: legacy fallback for pre-negotiation peers
//! - **Node**: orchestrates all of the above behind a transport boundary
//!   and an application-facing delegate
//!
//! ## Module Structure
//!
//! - [`packet`]: wire encoding/decoding
//! - [`dup_filter`]: duplicate/replay suppression
//! - [`fragment`]: payload fragmentation and reassembly
//! - [`identity`]: long-term identity and peer-id rotation
//! - [`session`]: per-peer Noise session state machine
//! - [`session_manager`]: fingerprint-keyed session table
//! - [`router`]: relay decisions and store-and-forward
//! - [`delivery`]: delivery/read-receipt tracking
//! - [`retry_queue`]: bounded retry for unsent messages
//! - [`version`]: protocol version negotiation
//! - [`config`]: node configuration
//! - [`node`]: orchestration layer tying the above together
//! - [`error`]: error types

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod delivery;
pub mod dup_filter;
pub mod error;
pub mod fragment;
pub mod identity;
pub mod node;
pub mod packet;
pub mod retry_queue;
pub mod router;
pub mod session;
pub mod session_manager;
pub mod version;

pub use config::NodeConfig;
pub use error::Error;
pub use identity::{IdentityAnnounce, PeerId, RotatingIdentity};
pub use node::{BleBackend, MeshDelegate, Node, TransportEvent, WriteKind};
pub use packet::{MessageType, Packet, PacketBuilder};
pub use router::Router;
pub use session_manager::SessionManager;
