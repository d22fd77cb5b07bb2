//! Two-node test fixture for mesh integration testing.
//!
//! Wires a pair of [`Node`]s together over an in-memory channel instead of
//! real BLE radios, so handshake, routing, and delivery-tracking behavior
//! can be exercised deterministically and without hardware.
//!
//! # Example
//!
//! ```no_run
//! use bitchat_integration_tests::fixtures::two_node::TwoNodeFixture;
//!
//! # async fn run() {
//! let mut fixture = TwoNodeFixture::new().await;
//! fixture.connect().await;
//! fixture.establish_session().await;
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};

use bitchat_core::node::{BleBackend, TransportEvent, WriteKind};
use bitchat_core::{MeshDelegate, Node, NodeConfig, PeerId, RotatingIdentity};
use bitchat_core::delivery::DeliveryAck;
use bitchat_core::error::RouterError;
use bitchat_core::packet::MessageType;
use bitchat_crypto::Fingerprint;

/// A [`BleBackend`] that hands every outbound write to the peer on the
/// other end of an unbounded channel, simulating a single radio link
/// between exactly two nodes. The link can be cut and restored via the
/// shared `link_up` flag, so tests can exercise store-and-forward.
pub struct ChannelBackend {
    peer_id: PeerId,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    link_up: Arc<AtomicBool>,
    pub sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

#[async_trait]
impl BleBackend for ChannelBackend {
    async fn send(&self, peer_id: PeerId, bytes: Vec<u8>, _write_kind: WriteKind) -> Result<(), RouterError> {
        if peer_id != self.peer_id {
            // Not our wired counterpart; drop silently, as a real radio
            // would for an address with no live link.
            return Ok(());
        }
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(RouterError::NoRoute);
        }
        self.sent.lock().await.push((peer_id, bytes.clone()));
        let _ = self.outbox.send(bytes);
        Ok(())
    }
}

/// Records every mesh event a [`Node`] raises, for test assertions.
#[derive(Default)]
pub struct RecordingDelegate {
    pub messages: StdMutex<Vec<(PeerId, MessageType, Option<[u8; 8]>, Vec<u8>)>>,
    pub delivery_acks: StdMutex<Vec<DeliveryAck>>,
    pub read_receipts: StdMutex<Vec<([u8; 8], PeerId)>>,
    pub identities_bound: StdMutex<Vec<(PeerId, Fingerprint)>>,
    pub peers_connected: StdMutex<Vec<PeerId>>,
    pub favorites: StdMutex<Vec<Fingerprint>>,
}

impl MeshDelegate for RecordingDelegate {
    fn on_message_received(
        &self,
        from: PeerId,
        message_type: MessageType,
        message_id: Option<[u8; 8]>,
        plaintext: &[u8],
    ) {
        self.messages
            .lock()
            .unwrap()
            .push((from, message_type, message_id, plaintext.to_vec()));
    }

    fn on_peer_connected(&self, peer_id: PeerId) {
        self.peers_connected.lock().unwrap().push(peer_id);
    }

    fn on_peer_disconnected(&self, _peer_id: PeerId) {}

    fn on_peer_list_changed(&self, _peers: &[PeerId]) {}

    fn on_delivery_ack(&self, ack: DeliveryAck) {
        self.delivery_acks.lock().unwrap().push(ack);
    }

    fn on_read_receipt(&self, message_id: [u8; 8], reader: PeerId) {
        self.read_receipts.lock().unwrap().push((message_id, reader));
    }

    fn on_identity_bound(&self, peer_id: PeerId, fingerprint: Fingerprint) {
        self.identities_bound.lock().unwrap().push((peer_id, fingerprint));
    }

    fn is_favorite(&self, fingerprint: Fingerprint) -> bool {
        self.favorites.lock().unwrap().contains(&fingerprint)
    }

    fn decrypt_channel_message(&self, _ciphertext: &[u8], _channel: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Two mesh nodes wired together over an in-memory channel, each with a
/// [`RecordingDelegate`] so tests can assert on what each side observed.
pub struct TwoNodeFixture {
    pub a: Arc<Node>,
    pub b: Arc<Node>,
    pub a_delegate: Arc<RecordingDelegate>,
    pub b_delegate: Arc<RecordingDelegate>,
    link_up: Arc<AtomicBool>,
    a_task: tokio::task::JoinHandle<()>,
    b_task: tokio::task::JoinHandle<()>,
}

impl TwoNodeFixture {
    /// Build two nodes with freshly generated identities and default config.
    pub async fn new() -> Self {
        Self::new_with_config(NodeConfig::default(), NodeConfig::default()).await
    }

    /// Build two nodes with per-side configuration, e.g. to shorten rekey
    /// or delivery-timeout intervals for a faster test.
    pub async fn new_with_config(config_a: NodeConfig, config_b: NodeConfig) -> Self {
        let identity_a = RotatingIdentity::generate().expect("generate identity a");
        let identity_b = RotatingIdentity::generate().expect("generate identity b");
        let peer_a = identity_a.current_peer_id();
        let peer_b = identity_b.current_peer_id();

        let (tx_to_b, mut rx_for_b) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_to_a, mut rx_for_a) = mpsc::unbounded_channel::<Vec<u8>>();
        let link_up = Arc::new(AtomicBool::new(true));

        let backend_a = Arc::new(ChannelBackend {
            peer_id: peer_b,
            outbox: tx_to_b,
            link_up: link_up.clone(),
            sent: Mutex::new(Vec::new()),
        });
        let backend_b = Arc::new(ChannelBackend {
            peer_id: peer_a,
            outbox: tx_to_a,
            link_up: link_up.clone(),
            sent: Mutex::new(Vec::new()),
        });

        let delegate_a = Arc::new(RecordingDelegate::default());
        let delegate_b = Arc::new(RecordingDelegate::default());

        let node_a = Arc::new(
            Node::with_identity(config_a, identity_a, backend_a, delegate_a.clone()).expect("build node a"),
        );
        let node_b = Arc::new(
            Node::with_identity(config_b, identity_b, backend_b, delegate_b.clone()).expect("build node b"),
        );
        node_a.start();
        node_b.start();

        let pump_a = Arc::clone(&node_a);
        let a_task = tokio::spawn(async move {
            while let Some(bytes) = rx_for_a.recv().await {
                let _ = pump_a
                    .handle_event(TransportEvent::PacketReceived { from: peer_b, bytes })
                    .await;
            }
        });
        let pump_b = Arc::clone(&node_b);
        let b_task = tokio::spawn(async move {
            while let Some(bytes) = rx_for_b.recv().await {
                let _ = pump_b
                    .handle_event(TransportEvent::PacketReceived { from: peer_a, bytes })
                    .await;
            }
        });

        Self {
            a: node_a,
            b: node_b,
            a_delegate: delegate_a,
            b_delegate: delegate_b,
            link_up,
            a_task,
            b_task,
        }
    }

    /// `a`'s advertised peer-id.
    pub async fn peer_a(&self) -> PeerId {
        self.a.current_peer_id().await
    }

    /// `b`'s advertised peer-id.
    pub async fn peer_b(&self) -> PeerId {
        self.b.current_peer_id().await
    }

    /// Bring the link up on both sides and let version negotiation settle.
    pub async fn connect(&self) {
        let peer_a = self.peer_a().await;
        let peer_b = self.peer_b().await;
        self.a.handle_peer_connected(peer_b).await;
        self.b.handle_peer_connected(peer_a).await;
        // Let the VersionHello/VersionAck exchange and handshake-tiebreak
        // drain through both channel pumps.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    /// Sever the simulated radio link and tell both nodes the peer dropped.
    /// Session bindings (keyed on long-term fingerprint) survive this, same
    /// as a real BLE disconnect.
    pub async fn disconnect(&self) {
        self.link_up.store(false, Ordering::SeqCst);
        let peer_a = self.peer_a().await;
        let peer_b = self.peer_b().await;
        self.a.handle_peer_disconnected(peer_b).await;
        self.b.handle_peer_disconnected(peer_a).await;
    }

    /// Restore the simulated radio link and tell both nodes the peer is
    /// reachable again, flushing any store-and-forward backlog.
    pub async fn reconnect(&self) {
        self.link_up.store(true, Ordering::SeqCst);
        let peer_a = self.peer_a().await;
        let peer_b = self.peer_b().await;
        self.a.handle_peer_connected(peer_b).await;
        self.b.handle_peer_connected(peer_a).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    /// `connect`, then wait for the Noise handshake to complete on both sides.
    pub async fn establish_session(&self) {
        self.connect().await;
        for _ in 0..20 {
            let bound_a = !self.a_delegate.identities_bound.lock().unwrap().is_empty();
            let bound_b = !self.b_delegate.identities_bound.lock().unwrap().is_empty();
            if bound_a && bound_b {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("handshake did not complete within the fixture's wait budget");
    }

    /// Wait until `predicate` holds for the given delegate, or panic after
    /// a short budget - used to await async mesh-queue effects without a
    /// fixed sleep.
    pub async fn wait_for(&self, mut predicate: impl FnMut() -> bool) {
        for _ in 0..50 {
            if predicate() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("condition did not become true within the fixture's wait budget");
    }
}

impl Drop for TwoNodeFixture {
    fn drop(&mut self) {
        self.a_task.abort();
        self.b_task.abort();
    }
}
