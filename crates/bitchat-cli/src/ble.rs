//! Dual-role BLE backend wiring for the `daemon` command.
//!
//! `bitchat-transport` exposes the central and peripheral roles as separate
//! types since they're built on different crates (`btleplug` vs `bluer`).
//! A real node runs both at once - it scans for other peripherals while
//! also advertising its own service - so this glues them behind one
//! [`BleBackend`], trying whichever role actually holds the connection to a
//! given peer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bitchat_core::error::RouterError;
use bitchat_core::node::{BleBackend, TransportEvent, WriteKind};
use bitchat_core::PeerId;
use bitchat_transport::central::CentralTransport;
use bitchat_transport::TransportConfig;

#[cfg(target_os = "linux")]
use bitchat_transport::peripheral::PeripheralTransport;

/// Combined central + (on Linux) peripheral transport.
pub struct DualBleBackend {
    central: Arc<CentralTransport>,
    #[cfg(target_os = "linux")]
    peripheral: Arc<PeripheralTransport>,
}

impl DualBleBackend {
    /// Build both roles and return the backend alongside the event
    /// receiver a caller should forward into [`bitchat_core::Node::handle_event`].
    #[must_use]
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let central = Arc::new(CentralTransport::new(config, tx.clone()));
        #[cfg(target_os = "linux")]
        let peripheral = Arc::new(PeripheralTransport::new(tx));

        (
            Self {
                central,
                #[cfg(target_os = "linux")]
                peripheral,
            },
            rx,
        )
    }

    /// Start scanning/connecting (central) and advertising/serving
    /// (peripheral, Linux only). `local_peer_id` is advertised verbatim as
    /// the peripheral's `local-name`.
    ///
    /// # Errors
    ///
    /// Returns an error if either role fails to bring its adapter up.
    pub async fn start(&self, local_peer_id: PeerId) -> anyhow::Result<()> {
        self.central.start().await?;
        #[cfg(target_os = "linux")]
        self.peripheral.start(local_peer_id).await?;
        #[cfg(not(target_os = "linux"))]
        let _ = local_peer_id;
        Ok(())
    }
}

#[async_trait]
impl BleBackend for DualBleBackend {
    async fn send(
        &self,
        peer_id: PeerId,
        bytes: Vec<u8>,
        write_kind: WriteKind,
    ) -> Result<(), RouterError> {
        match self.central.send(peer_id, bytes.clone(), write_kind).await {
            Ok(()) => Ok(()),
            Err(RouterError::NoRoute) => {
                #[cfg(target_os = "linux")]
                {
                    self.peripheral.send(peer_id, bytes, write_kind).await
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(RouterError::NoRoute)
                }
            }
            Err(e) => Err(e),
        }
    }
}
