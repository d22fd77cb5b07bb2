//! Terminal [`MeshDelegate`]: prints mesh events to stdout and keeps the
//! small amount of state the `status`/`peers` control-channel handlers need
//! to answer queries from a separate CLI invocation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bitchat_core::config::NodeConfig;
use bitchat_core::delivery::DeliveryAck;
use bitchat_core::node::MeshDelegate;
use bitchat_core::packet::MessageType;
use bitchat_core::PeerId;
use bitchat_crypto::Fingerprint;

/// Snapshot of one peer's state, tracked for `status`/`peers` introspection.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Long-term fingerprint, once an identity announcement binds it.
    pub fingerprint: Option<Fingerprint>,
    /// Whether the link is currently up.
    pub connected: bool,
}

/// Prints every mesh event to stdout and records peer state for the
/// control channel. Favorites and channel passwords are owned by a real
/// chat UI, not this CLI, so those two delegate hooks answer conservatively.
pub struct TerminalDelegate {
    nickname: String,
    peers: Mutex<BTreeMap<PeerId, PeerInfo>>,
}

impl TerminalDelegate {
    /// Build a delegate that prints messages under `nickname`'s name.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            nickname: config.identity.nickname.clone(),
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of every peer seen since startup, for the `peers` command.
    #[must_use]
    pub fn peer_snapshot(&self) -> Vec<(PeerId, PeerInfo)> {
        self.peers
            .lock()
            .expect("peer table mutex poisoned")
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect()
    }

    /// Count of peers currently connected, for the `status` command.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.peers
            .lock()
            .expect("peer table mutex poisoned")
            .values()
            .filter(|p| p.connected)
            .count()
    }
}

impl MeshDelegate for TerminalDelegate {
    fn on_message_received(
        &self,
        from: PeerId,
        message_type: MessageType,
        message_id: Option<[u8; 8]>,
        plaintext: &[u8],
    ) {
        let text = String::from_utf8_lossy(plaintext);
        match message_id {
            Some(id) => println!(
                "[{}] {:?} {} from {}: {text}",
                self.nickname,
                message_type,
                hex::encode(id),
                from.to_hex()
            ),
            None => println!("[{}] {:?} from {}: {text}", self.nickname, message_type, from.to_hex()),
        }
    }

    fn on_peer_connected(&self, peer_id: PeerId) {
        self.peers
            .lock()
            .expect("peer table mutex poisoned")
            .entry(peer_id)
            .or_insert(PeerInfo {
                fingerprint: None,
                connected: true,
            })
            .connected = true;
        println!("peer connected: {}", peer_id.to_hex());
    }

    fn on_peer_disconnected(&self, peer_id: PeerId) {
        if let Some(info) = self
            .peers
            .lock()
            .expect("peer table mutex poisoned")
            .get_mut(&peer_id)
        {
            info.connected = false;
        }
        println!("peer disconnected: {}", peer_id.to_hex());
    }

    fn on_peer_list_changed(&self, peers: &[PeerId]) {
        tracing::debug!(count = peers.len(), "active peer set changed");
    }

    fn on_delivery_ack(&self, ack: DeliveryAck) {
        println!("delivery ack: {ack:?}");
    }

    fn on_read_receipt(&self, message_id: [u8; 8], reader: PeerId) {
        println!(
            "read receipt for {}: read by {}",
            hex::encode(message_id),
            reader.to_hex()
        );
    }

    fn on_identity_bound(&self, peer_id: PeerId, fingerprint: Fingerprint) {
        self.peers
            .lock()
            .expect("peer table mutex poisoned")
            .entry(peer_id)
            .or_insert(PeerInfo {
                fingerprint: None,
                connected: true,
            })
            .fingerprint = Some(fingerprint);
        println!(
            "identity bound: {} -> {}",
            peer_id.to_hex(),
            fingerprint.to_hex()
        );
    }

    fn is_favorite(&self, _fingerprint: Fingerprint) -> bool {
        false
    }

    fn decrypt_channel_message(&self, _ciphertext: &[u8], _channel: &str) -> Option<Vec<u8>> {
        None
    }
}
