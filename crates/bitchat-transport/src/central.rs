//! Central role: scan for advertising peripherals, connect, and exchange
//! packets over the shared GATT characteristic.
//!
//! Grounded on `btleplug`'s `Central`/`Peripheral` traits. A discovered
//! device has no `PeerId` until its first notification arrives - BLE central
//! scanning only yields a platform-level [`PeripheralId`] - so devices are
//! tracked by that id in the [`ConnectionPool`] until the first decoded
//! packet's sender field reveals the peer's real identity.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use bitchat_core::error::RouterError;
use bitchat_core::node::{BleBackend, TransportEvent, WriteKind};
use bitchat_core::packet::Packet;
use bitchat_core::{Error, PeerId};

use crate::pool::ConnectionPool;
use crate::{BLE_MTU, CHARACTERISTIC_UUID, SERVICE_UUID, TransportConfig};

/// Central-role BLE transport: scans for and connects to peripherals
/// advertising [`SERVICE_UUID`], and implements [`BleBackend`] so a
/// [`bitchat_core::Node`] can send through it.
pub struct CentralTransport {
    config: TransportConfig,
    adapter: Mutex<Option<Adapter>>,
    pool: RwLock<ConnectionPool<PeripheralId, Peripheral>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl CentralTransport {
    /// Construct a central transport. `events` receives [`TransportEvent`]s
    /// as peers are identified, disconnect, or send packets; feed them to
    /// [`bitchat_core::Node::handle_event`].
    #[must_use]
    pub fn new(config: TransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            config,
            adapter: Mutex::new(None),
            pool: RwLock::new(ConnectionPool::default()),
            events,
        }
    }

    /// Acquire the first available BLE adapter and start scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is available or the scan can't start.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;
        let adapter = adapters.into_iter().next().ok_or_else(|| {
            Error::Router(RouterError::TransportWriteFailed(
                "no BLE adapter available".into(),
            ))
        })?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;
        info!("central: scanning for {}", SERVICE_UUID);

        let mut event_stream = adapter
            .events()
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;

        *self.adapter.lock().await = Some(adapter);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            use btleplug::api::CentralEvent;
            while let Some(event) = event_stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) => this.on_discovered(id).await,
                    CentralEvent::DeviceDisconnected(id) => this.on_disconnected(id).await,
                    _ => {}
                }
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.reconnect_loop().await });

        Ok(())
    }

    async fn on_discovered(self: &Arc<Self>, id: PeripheralId) {
        let Some(adapter) = self.adapter.lock().await.clone() else {
            return;
        };
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            return;
        };
        let Ok(Some(props)) = peripheral.properties().await else {
            return;
        };
        if let Some(rssi) = props.rssi
            && rssi < self.config.scan_rssi_floor_dbm
        {
            debug!("central: ignoring {id:?}, rssi {rssi} below floor {}", self.config.scan_rssi_floor_dbm);
            return;
        }

        {
            let mut pool = self.pool.write().await;
            pool.insert_if_absent(id.clone(), peripheral);
        }
        if let Err(e) = self.connect(&id).await {
            debug!("central: initial connect to {id:?} failed: {e}");
        }
    }

    async fn on_disconnected(&self, id: PeripheralId) {
        let peer_id = {
            let mut pool = self.pool.write().await;
            let Some(conn) = pool.get_mut(&id) else {
                return;
            };
            conn.mark_disconnected();
            conn.peer_id
        };
        if let Some(peer_id) = peer_id {
            let _ = self.events.send(TransportEvent::PeerDisconnected(peer_id));
        }
    }

    async fn connect(self: &Arc<Self>, id: &PeripheralId) -> Result<(), Error> {
        let peripheral = {
            let mut pool = self.pool.write().await;
            let conn = pool.get_mut(id).ok_or(Error::Router(RouterError::NoRoute))?;
            if conn.is_connected() {
                return Ok(());
            }
            conn.mark_attempting(Instant::now());
            conn.device.clone()
        };

        let connected =
            tokio::time::timeout(self.config.connection_timeout, peripheral.connect()).await;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if let Some(c) = self.pool.write().await.get_mut(id) {
                    c.mark_failed();
                }
                return Err(Error::Router(RouterError::TransportWriteFailed(
                    e.to_string(),
                )));
            }
            Err(_) => {
                if let Some(c) = self.pool.write().await.get_mut(id) {
                    c.mark_failed();
                }
                return Err(Error::Router(RouterError::TransportWriteFailed(
                    "connection timed out".into(),
                )));
            }
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;

        if let Some(c) = self.pool.write().await.get_mut(id) {
            c.mark_connected();
        }
        self.subscribe_and_listen(id.clone(), peripheral).await?;
        Ok(())
    }

    async fn subscribe_and_listen(
        self: &Arc<Self>,
        id: PeripheralId,
        peripheral: Peripheral,
    ) -> Result<(), Error> {
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .ok_or_else(|| {
                Error::Router(RouterError::TransportWriteFailed(
                    "characteristic not found".into(),
                ))
            })?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| Error::Router(RouterError::TransportWriteFailed(e.to_string())))?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid != CHARACTERISTIC_UUID {
                    continue;
                }
                this.on_packet_received(&id, data.value).await;
            }
            debug!("central: notification stream for {id:?} ended");
        });

        Ok(())
    }

    /// Decode the packet's sender field, bind it in the pool the first time
    /// it's seen, and forward the event upward.
    async fn on_packet_received(&self, id: &PeripheralId, bytes: Vec<u8>) {
        let Ok(packet) = Packet::parse(&bytes) else {
            debug!("central: dropping malformed notification from {id:?}");
            return;
        };
        let sender = PeerId::from_bytes(packet.sender_id());

        let newly_bound = {
            let mut pool = self.pool.write().await;
            let already_bound = pool.get(id).is_some_and(|c| c.peer_id.is_some());
            if !already_bound {
                pool.bind_peer_id(id, sender);
            }
            !already_bound
        };

        if newly_bound {
            let _ = self.events.send(TransportEvent::PeerConnected(sender));
        }
        let _ = self.events.send(TransportEvent::PacketReceived {
            from: sender,
            bytes,
        });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            if !self.config.auto_reconnect {
                continue;
            }
            let due: Vec<PeripheralId> = self.pool.read().await.retryable_keys(Instant::now());
            for id in due {
                if let Err(e) = self.connect(&id).await {
                    warn!("central: reconnect to {id:?} failed: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl BleBackend for CentralTransport {
    async fn send(
        &self,
        peer_id: PeerId,
        bytes: Vec<u8>,
        write_kind: WriteKind,
    ) -> Result<(), RouterError> {
        let id = self
            .pool
            .read()
            .await
            .key_for_peer(peer_id)
            .cloned()
            .ok_or(RouterError::NoRoute)?;

        let peripheral = {
            let pool = self.pool.read().await;
            let conn = pool.get(&id).ok_or(RouterError::NoRoute)?;
            if !conn.is_connected() {
                return Err(RouterError::NoRoute);
            }
            conn.device.clone()
        };

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .ok_or_else(|| RouterError::TransportWriteFailed("characteristic not found".into()))?;

        let write_type = match write_kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };

        for chunk in bytes.chunks(BLE_MTU) {
            peripheral
                .write(&characteristic, chunk, write_type)
                .await
                .map_err(|e| RouterError::TransportWriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}
