//! Peripheral role: advertise the mesh service and serve the shared
//! characteristic as a local GATT server.
//!
//! `btleplug` has no peripheral-mode support, so this half of the dual role
//! is built directly on `bluer` (BlueZ D-Bus bindings) and is Linux-only.
//! Every write to the characteristic from a connected central is decoded
//! far enough to learn the sender's `PeerId`, then forwarded as a
//! [`TransportEvent`]; outbound sends are delivered as GATT notifications.

use std::collections::HashMap;
use std::sync::Arc;

use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify, CharacteristicNotifyMethod,
    CharacteristicWrite, CharacteristicWriteMethod, Service, characteristic_control,
};
use bluer::adv::{Advertisement, AdvertisementHandle};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use bitchat_core::error::RouterError;
use bitchat_core::node::{BleBackend, TransportEvent, WriteKind};
use bitchat_core::packet::Packet;
use bitchat_core::PeerId;

use crate::{CHARACTERISTIC_UUID, SERVICE_UUID};

/// Peripheral-role BLE transport: advertises [`SERVICE_UUID`] and serves
/// [`CHARACTERISTIC_UUID`] as a local GATT server.
///
/// Implements [`BleBackend`] by pushing outbound bytes as notifications to
/// every subscribed central; `write_kind` is not meaningful for
/// notifications (there is no link-layer acknowledgment either way) and is
/// accepted only to satisfy the trait.
pub struct PeripheralTransport {
    notify_handle: RwLock<Option<bluer::gatt::local::CharacteristicControlHandle>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    known_senders: RwLock<HashMap<PeerId, ()>>,
    _advertisement: Mutex<Option<AdvertisementHandle>>,
    _application: Mutex<Option<ApplicationHandle>>,
}

impl PeripheralTransport {
    /// Build a peripheral transport. Call [`PeripheralTransport::start`] to
    /// actually advertise and serve the GATT application.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            notify_handle: RwLock::new(None),
            events,
            known_senders: RwLock::new(HashMap::new()),
            _advertisement: Mutex::new(None),
            _application: Mutex::new(None),
        }
    }

    /// Bring up the local adapter, advertise the mesh service, and register
    /// the characteristic with BlueZ.
    ///
    /// `local_peer_id` becomes the advertisement's `local-name` verbatim (16
    /// hex characters, no other app-identifying fields) so a scanning
    /// central can learn the peer-id before the first packet arrives.
    ///
    /// # Errors
    ///
    /// Returns a `bluer::Error` wrapped as a transport write failure if the
    /// adapter can't be powered on or the GATT application can't be
    /// registered.
    pub async fn start(self: &Arc<Self>, local_peer_id: PeerId) -> Result<(), RouterError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| RouterError::TransportWriteFailed(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| RouterError::TransportWriteFailed(e.to_string()))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| RouterError::TransportWriteFailed(e.to_string()))?;

        let advertisement = Advertisement {
            service_uuids: [SERVICE_UUID].into_iter().collect(),
            local_name: Some(local_peer_id.to_hex()),
            discoverable: Some(true),
            ..Default::default()
        };
        let adv_handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| RouterError::TransportWriteFailed(e.to_string()))?;
        *self._advertisement.lock().await = Some(adv_handle);

        let (char_control, char_handle) = characteristic_control();
        *self.notify_handle.write().await = Some(char_handle);

        let this = Arc::clone(self);
        let write_char = Characteristic {
            uuid: CHARACTERISTIC_UUID,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                    let this = Arc::clone(&this);
                    Box::pin(async move {
                        this.on_write(value).await;
                        Ok(())
                    })
                })),
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Io,
                ..Default::default()
            }),
            control_handle: char_control,
            ..Default::default()
        };

        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: vec![write_char],
                ..Default::default()
            }],
            ..Default::default()
        };

        let app_handle = adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| RouterError::TransportWriteFailed(e.to_string()))?;
        *self._application.lock().await = Some(app_handle);

        info!("peripheral: advertising {} on {}", SERVICE_UUID, adapter.name());
        Ok(())
    }

    /// A central wrote `value` to our characteristic: decode the sender and
    /// forward the bytes upward, emitting `PeerConnected` the first time a
    /// given peer-id is seen.
    async fn on_write(&self, value: Vec<u8>) {
        let Ok(packet) = Packet::parse(&value) else {
            debug!("peripheral: dropping malformed write");
            return;
        };
        let sender = PeerId::from_bytes(packet.sender_id());

        let first_seen = {
            let mut known = self.known_senders.write().await;
            known.insert(sender, ()).is_none()
        };
        if first_seen {
            let _ = self.events.send(TransportEvent::PeerConnected(sender));
        }
        let _ = self.events.send(TransportEvent::PacketReceived {
            from: sender,
            bytes: value,
        });
    }
}

#[async_trait::async_trait]
impl BleBackend for PeripheralTransport {
    async fn send(
        &self,
        _peer_id: PeerId,
        bytes: Vec<u8>,
        _write_kind: WriteKind,
    ) -> Result<(), RouterError> {
        let handle = self.notify_handle.read().await;
        let Some(handle) = handle.as_ref() else {
            return Err(RouterError::NoRoute);
        };

        for chunk in bytes.chunks(crate::BLE_MTU) {
            if let Err(e) = handle.notify(chunk.to_vec()).await {
                warn!("peripheral: notify failed: {e}");
                return Err(RouterError::TransportWriteFailed(e.to_string()));
            }
        }
        Ok(())
    }
}
