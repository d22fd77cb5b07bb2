//! Node orchestration: wires identity, session manager, router, fragment
//! reassembly, delivery tracking, and retry queue behind a transport
//! boundary and an application delegate.
//!
//! This is the "mesh queue" owner of the concurrency model: one [`Node`]
//! serializes router state mutations, while per-peer Noise sessions (owned
//! by the [`crate::session_manager::SessionManager`]) run in parallel across
//! peers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitchat_crypto::Fingerprint;
use dashmap::DashMap;
use rand_core::{OsRng, RngCore};
use tokio::sync::Mutex;

use crate::config::NodeConfig;
use crate::delivery::{DeliveryAck, DeliveryTracker};
use crate::error::{Error, PacketError, RouterError, SessionError};
use crate::fragment;
use crate::identity::{IdentityAnnounce, PeerId, RotatingIdentity};
use crate::packet::{MessageType, Packet, PacketBuilder, MAX_PAYLOAD_SIZE, PEER_ID_SIZE};
use crate::retry_queue::RetryQueue;
use crate::router::{Disposition, Router};
use crate::session_manager::SessionManager;
use crate::version::{VersionAck, VersionHello, VersionNegotiator};

/// Whether a BLE write should use `withResponse` (reliable) or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Reliable write, used for payloads over 512B and handshake traffic.
    WithResponse,
    /// Fire-and-forget write for small, non-critical traffic.
    WithoutResponse,
}

/// The BLE transport boundary a [`Node`] sends through.
///
/// Implemented by `bitchat-transport`'s central/peripheral backends; a test
/// double backed by in-memory channels stands in for it in integration tests.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Send raw encoded packet bytes to `peer_id`.
    async fn send(
        &self,
        peer_id: PeerId,
        bytes: Vec<u8>,
        write_kind: WriteKind,
    ) -> Result<(), RouterError>;
}

/// An event pushed up from the transport layer into the mesh queue.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer's radio link came up and passed version negotiation.
    PeerConnected(PeerId),
    /// A peer's radio link went down.
    PeerDisconnected(PeerId),
    /// Raw bytes arrived from `from`.
    PacketReceived { from: PeerId, bytes: Vec<u8> },
}

/// Narrow capability set the application layer implements to receive mesh
/// events and answer policy questions the core can't decide on its own.
pub trait MeshDelegate: Send + Sync {
    /// A plaintext chat message (broadcast or decrypted private) arrived.
    ///
    /// `message_id` is `Some` for user chat content (carries the id the
    /// sender tracks delivery under, needed to answer with
    /// [`Node::send_read_receipt`]) and `None` for announcements and channel
    /// administrative traffic, which aren't delivery-tracked.
    fn on_message_received(
        &self,
        from: PeerId,
        message_type: MessageType,
        message_id: Option<[u8; 8]>,
        plaintext: &[u8],
    );
    /// A peer's link came up and finished version negotiation.
    fn on_peer_connected(&self, peer_id: PeerId);
    /// A peer's link went down.
    fn on_peer_disconnected(&self, peer_id: PeerId);
    /// The active peer set changed.
    fn on_peer_list_changed(&self, peers: &[PeerId]);
    /// A delivery acknowledgment was received for one of our messages.
    fn on_delivery_ack(&self, ack: DeliveryAck);
    /// A read receipt was received for one of our messages.
    fn on_read_receipt(&self, message_id: [u8; 8], reader: PeerId);
    /// A peer-id was bound (or rebound) to a long-term fingerprint.
    fn on_identity_bound(&self, peer_id: PeerId, fingerprint: Fingerprint);
    /// Whether `fingerprint` is one of the user's favorites.
    fn is_favorite(&self, fingerprint: Fingerprint) -> bool;
    /// Decrypt a channel message given the channel's shared password state.
    /// Returns `None` if the channel is unknown or the password doesn't match.
    fn decrypt_channel_message(&self, ciphertext: &[u8], channel: &str) -> Option<Vec<u8>>;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Mesh protocol orchestrator for one local identity.
pub struct Node {
    identity: Mutex<RotatingIdentity>,
    sessions: SessionManager,
    router: Mutex<Router>,
    delivery: Mutex<DeliveryTracker>,
    retry_queue: Mutex<RetryQueue>,
    versions: DashMap<PeerId, VersionNegotiator>,
    config: NodeConfig,
    transport: Arc<dyn BleBackend>,
    delegate: Arc<dyn MeshDelegate>,
    running: AtomicBool,
}

impl Node {
    /// Build a node with a freshly generated identity.
    ///
    /// # Errors
    ///
    /// Returns an error if identity generation fails.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn BleBackend>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Result<Self, Error> {
        Self::with_identity(config, RotatingIdentity::generate()?, transport, delegate)
    }

    /// Build a node from an identity loaded from persistent storage, so its
    /// fingerprint and signed identity announcements survive a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity's Noise keypair can't be cloned into
    /// the session manager.
    pub fn with_identity(
        config: NodeConfig,
        identity: RotatingIdentity,
        transport: Arc<dyn BleBackend>,
        delegate: Arc<dyn MeshDelegate>,
    ) -> Result<Self, Error> {
        let self_peer_id = identity.current_peer_id();
        let local_keypair = Arc::new(identity.static_keypair().clone());
        Ok(Self {
            identity: Mutex::new(identity),
            sessions: SessionManager::new(local_keypair),
            router: Mutex::new(Router::new(self_peer_id)),
            delivery: Mutex::new(DeliveryTracker::default()),
            retry_queue: Mutex::new(RetryQueue::new()),
            versions: DashMap::new(),
            config,
            transport,
            delegate,
            running: AtomicBool::new(false),
        })
    }

    /// The long-term fingerprint of this node's identity.
    pub async fn fingerprint(&self) -> Fingerprint {
        self.identity.lock().await.fingerprint()
    }

    /// The peer-id currently advertised on the wire.
    pub async fn current_peer_id(&self) -> PeerId {
        self.identity.lock().await.current_peer_id()
    }

    /// Whether the node's background loops should keep running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Mark the node started. Callers spawn the periodic sweep tasks
    /// separately; this just flips the flag background loops check.
    pub fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
    }

    /// Broadcast a plaintext `Leave` and stop background processing.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let peer_id = self.current_peer_id().await;
        let packet = PacketBuilder::new(MessageType::Leave, peer_id.as_bytes(), 1)
            .timestamp(now_ms())
            .build();
        let _ = self.broadcast_raw(packet).await;
    }

    /// Originate a broadcast chat message: fragments it if oversized, tracks
    /// its delivery state, and hands it to every currently connected peer
    /// (or the retry queue, if none are connected right now).
    ///
    /// Returns the message-id used to correlate `on_delivery_ack` callbacks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Packet` if the content is too large to fragment.
    pub async fn send_broadcast(&self, content: &[u8]) -> Result<[u8; 8], Error> {
        let message_id = random_message_id();
        let payload = encode_chat_payload(message_id, content);
        let expected = self.router.lock().await.active_peer_count();

        self.delivery.lock().await.track(message_id, false, false, expected);
        let sent = self
            .emit_payload(MessageType::Message, None, message_id, payload)
            .await?;
        if sent {
            self.delivery.lock().await.mark_sent(message_id);
        }
        Ok(message_id)
    }

    /// Send a private message to `to`, encrypted under its established Noise
    /// session. Favorite recipients that are currently unreachable are
    /// stored for store-and-forward instead of handed to the retry queue.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session(SessionError::UnknownSession)` if no session
    /// is established with `to` yet.
    pub async fn send_private(&self, to: PeerId, content: &[u8]) -> Result<[u8; 8], Error> {
        let fingerprint = self
            .sessions
            .fingerprint_for(to)
            .ok_or(Error::Session(SessionError::UnknownSession))?;
        let message_id = random_message_id();
        let payload = encode_chat_payload(message_id, content);
        let envelope = encode_encrypted_envelope(MessageType::Message, &payload);
        let ciphertext = self
            .sessions
            .encrypt(fingerprint, &envelope)
            .await
            .map_err(Error::Session)?;

        let is_favorite = self.delegate.is_favorite(fingerprint);
        if is_favorite {
            self.router.lock().await.mark_favorite(fingerprint);
        }
        self.delivery.lock().await.track(message_id, false, is_favorite, 1);

        let connected = self.router.lock().await.active_peer_ids().contains(&to);
        if !connected && is_favorite {
            let self_id = self.current_peer_id().await;
            let ttl = self.router.lock().await.originate_ttl();
            let packet = PacketBuilder::new(MessageType::NoiseEncrypted, self_id.as_bytes(), ttl)
                .timestamp(now_ms())
                .recipient(to.as_bytes())
                .payload(ciphertext)
                .build();
            let mut router = self.router.lock().await;
            router.mark_offline(fingerprint);
            router.store_for_offline_favorite(fingerprint, message_id, packet);
            return Ok(message_id);
        }

        let sent = self
            .emit_payload(MessageType::NoiseEncrypted, Some(to), message_id, ciphertext)
            .await?;
        if sent {
            self.delivery.lock().await.mark_sent(message_id);
        }
        Ok(message_id)
    }

    /// Send a read receipt for a previously received private message.
    /// Intended to be invoked by the application layer when its chat view
    /// for `to` is opened, per the app-triggered read-receipt flow.
    ///
    /// Follows the same path as a `DeliveryAck`: encrypted via the
    /// established Noise session and routed back with `ttl=3`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session(SessionError::UnknownSession)` if no session
    /// is established with `to`, or `Error::Router` if the transport send
    /// fails.
    pub async fn send_read_receipt(&self, to: PeerId, message_id: [u8; 8]) -> Result<(), Error> {
        let fingerprint = self
            .sessions
            .fingerprint_for(to)
            .ok_or(Error::Session(SessionError::UnknownSession))?;
        let envelope = encode_encrypted_envelope(MessageType::ReadReceipt, &message_id);
        let ciphertext = self
            .sessions
            .encrypt(fingerprint, &envelope)
            .await
            .map_err(Error::Session)?;

        let self_id = self.current_peer_id().await;
        let packet = PacketBuilder::new(MessageType::NoiseEncrypted, self_id.as_bytes(), 3)
            .timestamp(now_ms())
            .recipient(to.as_bytes())
            .payload(ciphertext)
            .build();
        self.transport
            .send(to, packet.encode(), WriteKind::WithResponse)
            .await
            .map_err(Error::Router)
    }

    async fn send_delivery_ack(&self, to: PeerId, original_message_id: [u8; 8]) -> Result<(), Error> {
        let fingerprint = self
            .sessions
            .fingerprint_for(to)
            .ok_or(Error::Session(SessionError::UnknownSession))?;
        let self_id = self.current_peer_id().await;
        let ack = DeliveryAck {
            ack_id: random_message_id(),
            original_message_id,
            recipient_id: self_id,
            hop_count: 0,
        };
        let envelope = encode_encrypted_envelope(MessageType::DeliveryAck, &encode_delivery_ack(&ack));
        let ciphertext = self
            .sessions
            .encrypt(fingerprint, &envelope)
            .await
            .map_err(Error::Session)?;

        let packet = PacketBuilder::new(MessageType::NoiseEncrypted, self_id.as_bytes(), 3)
            .timestamp(now_ms())
            .recipient(to.as_bytes())
            .payload(ciphertext)
            .build();
        self.transport
            .send(to, packet.encode(), WriteKind::WithResponse)
            .await
            .map_err(Error::Router)
    }

    /// Drain and send a favorite's store-and-forward queue once it's reachable again.
    async fn flush_store_and_forward(&self, peer_id: PeerId, fingerprint: Fingerprint) {
        let flushed = self.router.lock().await.flush_for(fingerprint);
        for packet in flushed {
            let bytes = packet.encode();
            let write_kind = if bytes.len() > 512 {
                WriteKind::WithResponse
            } else {
                WriteKind::WithoutResponse
            };
            let _ = self.transport.send(peer_id, bytes, write_kind).await;
            tokio::time::sleep(crate::router::FLUSH_SPACING).await;
        }
    }

    /// Fragment (if needed) and hand a user-originated payload to the
    /// current active peer set, falling back to the retry queue if none are
    /// connected or every send attempt failed. Returns whether at least one
    /// peer accepted it.
    async fn emit_payload(
        &self,
        message_type: MessageType,
        recipient: Option<PeerId>,
        message_id: [u8; 8],
        payload: Vec<u8>,
    ) -> Result<bool, Error> {
        let self_id = self.current_peer_id().await;
        let ttl = self.router.lock().await.originate_ttl();
        let now = now_ms();
        let targets = match recipient {
            Some(peer) => vec![peer],
            None => self.router.lock().await.active_peer_ids(),
        };
        let packets = build_outbound_packets(message_type, self_id, recipient, ttl, now, payload);

        if targets.is_empty() {
            for packet in &packets {
                self.retry_queue.lock().await.push(message_id, now, packet.encode());
            }
            return Ok(false);
        }

        let mut any_ok = false;
        for packet in &packets {
            let bytes = packet.encode();
            let write_kind = if bytes.len() > 512 {
                WriteKind::WithResponse
            } else {
                WriteKind::WithoutResponse
            };
            for &peer in &targets {
                if self.transport.send(peer, bytes.clone(), write_kind).await.is_ok() {
                    any_ok = true;
                }
            }
        }
        if !any_ok {
            for packet in &packets {
                self.retry_queue.lock().await.push(message_id, now, packet.encode());
            }
        }
        Ok(any_ok)
    }

    async fn broadcast_raw(&self, packet: Packet) -> Result<(), RouterError> {
        let peers = self.router.lock().await.active_peer_ids();
        let bytes = packet.encode();
        let write_kind = if bytes.len() > 512 {
            WriteKind::WithResponse
        } else {
            WriteKind::WithoutResponse
        };
        let mut last_err = None;
        for peer in peers {
            if let Err(e) = self.transport.send(peer, bytes.clone(), write_kind).await {
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// A peer link came up: register it with the router and kick off
    /// version negotiation.
    pub async fn handle_peer_connected(&self, peer_id: PeerId) {
        self.router.lock().await.peer_connected(peer_id);
        self.versions.insert(peer_id, VersionNegotiator::new());

        let hello = VersionHello::ours();
        let payload = encode_version_hello(&hello);
        let self_id = self.current_peer_id().await;
        let packet = PacketBuilder::new(MessageType::VersionHello, self_id.as_bytes(), 1)
            .timestamp(now_ms())
            .recipient(peer_id.as_bytes())
            .payload(payload)
            .build();
        let _ = self
            .transport
            .send(peer_id, packet.encode(), WriteKind::WithResponse)
            .await;

        self.delegate.on_peer_connected(peer_id);

        // A session may already be bound from before this link dropped
        // (peer-ids and fingerprints outlive a single radio connection);
        // in that case there's no handshake to re-run, so flush any
        // store-and-forward backlog for it directly.
        if let Some(fingerprint) = self.sessions.fingerprint_for(peer_id) {
            self.flush_store_and_forward(peer_id, fingerprint).await;
        }
    }

    /// A peer link went down.
    pub async fn handle_peer_disconnected(&self, peer_id: PeerId) {
        self.router.lock().await.peer_disconnected(peer_id);
        self.versions.remove(&peer_id);
        self.delegate.on_peer_disconnected(peer_id);
    }

    /// Drive one `TransportEvent` through the node.
    ///
    /// # Errors
    ///
    /// Returns `Error::Packet` if the bytes don't parse as a valid packet.
    pub async fn handle_event(&self, event: TransportEvent) -> Result<(), Error> {
        match event {
            TransportEvent::PeerConnected(peer_id) => {
                self.handle_peer_connected(peer_id).await;
                Ok(())
            }
            TransportEvent::PeerDisconnected(peer_id) => {
                self.handle_peer_disconnected(peer_id).await;
                Ok(())
            }
            TransportEvent::PacketReceived { from, bytes } => {
                self.handle_inbound(from, &bytes).await
            }
        }
    }

    async fn handle_inbound(&self, from: PeerId, bytes: &[u8]) -> Result<(), Error> {
        let packet = Packet::parse_with_limit(bytes, MAX_PAYLOAD_SIZE)?;

        if packet.message_type() == MessageType::VersionHello {
            return self.handle_version_hello(from, &packet).await;
        }
        if packet.message_type() == MessageType::VersionAck {
            return self.handle_version_ack(from, &packet).await;
        }

        let disposition = {
            let mut router = self.router.lock().await;
            let mut rng = rand::thread_rng();
            router.ingest(packet, now_ms(), &mut rng)
        };

        match disposition {
            Disposition::Drop(_) => Ok(()),
            Disposition::Deliver(packet) => self.dispatch(from, packet).await,
            Disposition::DeliverAndRelay(packet, plan) => {
                self.dispatch(from, packet).await?;
                if let Some(plan) = plan {
                    self.relay(plan).await;
                }
                Ok(())
            }
            Disposition::RelayOnly(plan) => {
                if let Some(plan) = plan {
                    self.relay(plan).await;
                }
                Ok(())
            }
        }
    }

    async fn relay(&self, plan: crate::router::RelayPlan) {
        tokio::time::sleep(plan.jitter).await;
        let bytes = plan.packet.encode();
        let write_kind = if bytes.len() > 512 {
            WriteKind::WithResponse
        } else {
            WriteKind::WithoutResponse
        };
        let peers = self.router.lock().await.active_peer_ids();
        for peer in peers {
            let _ = self.transport.send(peer, bytes.clone(), write_kind).await;
        }
    }

    async fn handle_version_hello(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let hello = decode_version_hello(packet.payload())
            .ok_or_else(|| Error::Packet(PacketError::Malformed("bad VersionHello".into())))?;
        let ack = self
            .versions
            .entry(from)
            .or_insert_with(VersionNegotiator::new)
            .receive_hello(&hello);

        let self_id = self.current_peer_id().await;
        let reply = PacketBuilder::new(MessageType::VersionAck, self_id.as_bytes(), 1)
            .timestamp(now_ms())
            .recipient(from.as_bytes())
            .payload(encode_version_ack(&ack))
            .build();
        self.transport
            .send(from, reply.encode(), WriteKind::WithResponse)
            .await
            .map_err(Error::Router)?;

        if !ack.is_agreed() {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                tokio::time::sleep(crate::version::REJECT_DISCONNECT_DELAY).await;
                let _ = transport.send(from, Vec::new(), WriteKind::WithoutResponse).await;
            });
        } else {
            self.maybe_initiate_handshake(from).await?;
        }
        Ok(())
    }

    async fn handle_version_ack(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let agreed = if let Some(ack) = decode_version_ack(packet.payload())
            && let Some(mut negotiator) = self.versions.get_mut(&from)
        {
            negotiator.receive_ack(&ack);
            negotiator.is_settled()
        } else {
            false
        };
        if agreed {
            self.maybe_initiate_handshake(from).await?;
        }
        Ok(())
    }

    /// If this side is the smaller peer-id in the tie-break and no session
    /// exists with `from` yet, send a Noise handshake init.
    async fn maybe_initiate_handshake(&self, peer_id: PeerId) -> Result<(), Error> {
        let self_id = self.current_peer_id().await;
        if self.sessions.fingerprint_for(peer_id).is_some() {
            return Ok(());
        }
        if !SessionManager::should_initiate(self_id, peer_id) {
            return Ok(());
        }
        let temp_fp = SessionManager::temp_fingerprint_for(peer_id);
        let init_msg = self.sessions.initiate(temp_fp).await.map_err(Error::Session)?;
        self.sessions.bind(peer_id, temp_fp);

        let packet = PacketBuilder::new(MessageType::NoiseHandshakeInit, self_id.as_bytes(), 1)
            .timestamp(now_ms())
            .recipient(peer_id.as_bytes())
            .payload(init_msg)
            .build();
        self.transport
            .send(peer_id, packet.encode(), WriteKind::WithResponse)
            .await
            .map_err(Error::Router)
    }

    async fn dispatch(&self, from: PeerId, packet: Packet) -> Result<(), Error> {
        match packet.message_type() {
            MessageType::Message => {
                let (message_id, content) = decode_chat_payload(packet.payload())
                    .ok_or_else(|| Error::Packet(PacketError::Malformed("bad Message payload".into())))?;
                self.delegate
                    .on_message_received(from, MessageType::Message, Some(message_id), content);
                Ok(())
            }
            MessageType::Announce => {
                self.delegate
                    .on_message_received(from, MessageType::Announce, None, packet.payload());
                Ok(())
            }
            MessageType::Leave => {
                self.handle_peer_disconnected(from).await;
                Ok(())
            }
            MessageType::FragmentStart | MessageType::FragmentContinue | MessageType::FragmentEnd => {
                self.handle_fragment(from, &packet).await
            }
            MessageType::NoiseHandshakeInit => self.handle_handshake_init(from, &packet).await,
            MessageType::NoiseHandshakeResp => self.handle_handshake_resp(from, &packet).await,
            MessageType::NoiseEncrypted => self.handle_encrypted(from, &packet).await,
            MessageType::NoiseIdentityAnnounce => self.handle_identity_announce(from, &packet).await,
            MessageType::DeliveryAck => self.handle_delivery_ack(&packet).await,
            MessageType::ReadReceipt => self.handle_read_receipt(from, &packet).await,
            MessageType::ChannelAnnounce
            | MessageType::ChannelMetadata
            | MessageType::ChannelRetention
            | MessageType::ChannelKeyVerifyRequest
            | MessageType::ChannelKeyVerifyResponse
            | MessageType::ChannelPasswordUpdate => {
                self.delegate
                    .on_message_received(from, packet.message_type(), None, packet.payload());
                Ok(())
            }
            MessageType::DeliveryStatusRequest | MessageType::VersionHello | MessageType::VersionAck => {
                Ok(())
            }
        }
    }

    async fn handle_fragment(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let payload = packet.payload();
        if payload.len() < 12 {
            return Err(Error::Packet(PacketError::Malformed(
                "fragment payload too short".into(),
            )));
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[0..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);
        let original_type = payload[12];
        let slice = payload[13..].to_vec();

        let fragment = fragment::Fragment {
            fragment_id,
            index,
            total,
            original_type,
            slice,
        };

        let reassembled = {
            let mut router = self.router.lock().await;
            router
                .ingest_fragment(fragment)
                .map_err(Error::Session)?
        };

        if let Some((original_type, payload)) = reassembled {
            let message_type = MessageType::try_from(original_type).map_err(Error::Packet)?;
            let mut builder = PacketBuilder::new(message_type, from.as_bytes(), packet.ttl()).timestamp(now_ms());
            if let Some(recipient) = packet.recipient_id() {
                builder = builder.recipient(recipient);
            }
            let synthetic = builder.payload(payload).build();
            self.dispatch(from, synthetic).await?;
        }
        Ok(())
    }

    async fn handle_handshake_init(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let temp_fp = SessionManager::temp_fingerprint_for(from);
        let reply = self
            .sessions
            .accept(temp_fp, packet.payload())
            .await
            .map_err(Error::Session)?;
        self.sessions.bind(from, temp_fp);

        let self_id = self.current_peer_id().await;
        let response = PacketBuilder::new(MessageType::NoiseHandshakeResp, self_id.as_bytes(), 1)
            .timestamp(now_ms())
            .recipient(from.as_bytes())
            .payload(reply)
            .build();
        self.transport
            .send(from, response.encode(), WriteKind::WithResponse)
            .await
            .map_err(Error::Router)?;
        Ok(())
    }

    async fn handle_handshake_resp(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let Some(fingerprint) = self.sessions.fingerprint_for(from) else {
            return Err(Error::Session(SessionError::UnknownSession));
        };
        let maybe_final = self
            .sessions
            .advance_handshake(fingerprint, packet.payload())
            .await
            .map_err(Error::Session)?;

        if let Some(final_msg) = maybe_final {
            let self_id = self.current_peer_id().await;
            let response = PacketBuilder::new(MessageType::NoiseHandshakeResp, self_id.as_bytes(), 1)
                .timestamp(now_ms())
                .recipient(from.as_bytes())
                .payload(final_msg)
                .build();
            self.transport
                .send(from, response.encode(), WriteKind::WithResponse)
                .await
                .map_err(Error::Router)?;
            // initiator side completing on msg3: promote the temp-keyed
            // session to the real fingerprint msg2 just revealed.
            let real_fingerprint = self
                .sessions
                .rebind_to_fingerprint(fingerprint, from)
                .await
                .unwrap_or(fingerprint);
            self.delegate.on_identity_bound(from, real_fingerprint);
            self.send_identity_announce(from).await?;
            self.flush_store_and_forward(from, real_fingerprint).await;
            return Ok(());
        }

        // responder side completing on the final handshake message: promote
        // the temp-keyed session to the real fingerprint it just revealed.
        let real_fingerprint = self
            .sessions
            .rebind_to_fingerprint(fingerprint, from)
            .await
            .unwrap_or(fingerprint);
        self.delegate.on_identity_bound(from, real_fingerprint);
        self.send_identity_announce(from).await?;
        self.flush_store_and_forward(from, real_fingerprint).await;
        Ok(())
    }

    async fn send_identity_announce(&self, to: PeerId) -> Result<(), Error> {
        let announce = self
            .identity
            .lock()
            .await
            .announce(&self.config.identity.nickname);
        let payload = encode_identity_announce(&announce);
        let self_id = self.current_peer_id().await;
        let packet = PacketBuilder::new(MessageType::NoiseIdentityAnnounce, self_id.as_bytes(), 1)
            .timestamp(now_ms())
            .recipient(to.as_bytes())
            .payload(payload)
            .build();
        self.transport
            .send(to, packet.encode(), WriteKind::WithResponse)
            .await
            .map_err(Error::Router)
    }

    async fn handle_encrypted(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let Some(fingerprint) = self.sessions.fingerprint_for(from) else {
            return Err(Error::Session(SessionError::UnknownSession));
        };
        let plaintext = self
            .sessions
            .decrypt(fingerprint, packet.payload())
            .await
            .map_err(Error::Session)?;

        if Router::is_cover_traffic(&plaintext) {
            return Ok(());
        }

        let (inner_type, inner_payload) = decode_encrypted_envelope(&plaintext)
            .ok_or_else(|| Error::Packet(PacketError::Malformed("bad NoiseEncrypted payload".into())))?;

        match inner_type {
            MessageType::Message => {
                let (message_id, content) = decode_chat_payload(inner_payload).ok_or_else(|| {
                    Error::Packet(PacketError::Malformed("bad NoiseEncrypted payload".into()))
                })?;
                self.delegate
                    .on_message_received(from, MessageType::NoiseEncrypted, Some(message_id), content);
                self.send_delivery_ack(from, message_id).await?;
                Ok(())
            }
            MessageType::DeliveryAck => {
                let ack = decode_delivery_ack(inner_payload)
                    .ok_or_else(|| Error::Packet(PacketError::Malformed("bad DeliveryAck".into())))?;
                self.delivery.lock().await.apply_ack(&ack);
                self.delegate.on_delivery_ack(ack);
                Ok(())
            }
            MessageType::ReadReceipt => {
                if inner_payload.len() != 8 {
                    return Err(Error::Packet(PacketError::Malformed(
                        "bad read receipt payload".into(),
                    )));
                }
                let mut message_id = [0u8; 8];
                message_id.copy_from_slice(inner_payload);
                self.delivery.lock().await.apply_read_receipt(message_id, from);
                self.delegate.on_read_receipt(message_id, from);
                Ok(())
            }
            _ => Err(Error::Packet(PacketError::Malformed(
                "unexpected NoiseEncrypted envelope type".into(),
            ))),
        }
    }

    async fn handle_identity_announce(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let announce = decode_identity_announce(packet.payload())
            .ok_or_else(|| Error::Packet(PacketError::Malformed("bad IdentityAnnounce".into())))?;
        announce
            .verify()
            .map_err(|_| Error::Packet(PacketError::Malformed("identity signature invalid".into())))?;
        if now_ms().abs_diff(announce.timestamp) > crate::router::REPLAY_WINDOW_MS {
            return Err(Error::Router(RouterError::ReplayWindow));
        }

        if let Some(existing) = self.sessions.fingerprint_for(from)
            && existing != announce.fingerprint
        {
            self.sessions.migrate(from, announce.peer_id, announce.fingerprint);
        } else {
            self.sessions.bind(announce.peer_id, announce.fingerprint);
        }
        self.delegate.on_identity_bound(from, announce.fingerprint);
        self.flush_store_and_forward(from, announce.fingerprint).await;
        Ok(())
    }

    async fn handle_delivery_ack(&self, packet: &Packet) -> Result<(), Error> {
        let ack = decode_delivery_ack(packet.payload())
            .ok_or_else(|| Error::Packet(PacketError::Malformed("bad DeliveryAck".into())))?;
        self.delivery.lock().await.apply_ack(&ack);
        self.delegate.on_delivery_ack(ack);
        Ok(())
    }

    async fn handle_read_receipt(&self, from: PeerId, packet: &Packet) -> Result<(), Error> {
        let payload = packet.payload();
        if payload.len() < 8 {
            return Err(Error::Packet(PacketError::Malformed(
                "read receipt payload too short".into(),
            )));
        }
        let mut message_id = [0u8; 8];
        message_id.copy_from_slice(&payload[..8]);
        self.delivery.lock().await.apply_read_receipt(message_id, from);
        self.delegate.on_read_receipt(message_id, from);
        Ok(())
    }

    /// Periodic sweep: retries, delivery timeouts, session rekeys, and
    /// (where due) peer-id rotation. Intended to be invoked from a timer
    /// loop on the mesh queue.
    pub async fn run_periodic_tasks(&self) {
        let retries = {
            let mut delivery = self.delivery.lock().await;
            delivery.sweep_timeouts()
        };
        for message_id in retries {
            let mut delivery = self.delivery.lock().await;
            delivery.mark_retried(message_id);
        }

        let peers = self.router.lock().await.active_peer_ids();
        let due = self.retry_queue.lock().await.take_due(!peers.is_empty());
        for bytes in due {
            for &peer in &peers {
                let _ = self
                    .transport
                    .send(peer, bytes.clone(), WriteKind::WithResponse)
                    .await;
            }
        }

        let mut identity = self.identity.lock().await;
        if identity.is_rotation_due(self.config.session.rekey_after)
            && !self.sessions.any_handshaking().await
        {
            let _ = identity.rotate();
        }
    }
}

fn random_message_id() -> [u8; 8] {
    let mut id = [0u8; 8];
    OsRng.fill_bytes(&mut id);
    id
}

/// Prefix `content` with its 8-byte message-id, the application-layer
/// convention that lets a `DeliveryAck`/read receipt correlate back to the
/// chat message it answers (the wire `Packet` header has no id field).
fn encode_chat_payload(message_id: [u8; 8], content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + content.len());
    out.extend_from_slice(&message_id);
    out.extend_from_slice(content);
    out
}

fn decode_chat_payload(bytes: &[u8]) -> Option<([u8; 8], &[u8])> {
    if bytes.len() < 8 {
        return None;
    }
    let mut message_id = [0u8; 8];
    message_id.copy_from_slice(&bytes[..8]);
    Some((message_id, &bytes[8..]))
}

/// Prefix a `NoiseEncrypted` plaintext with its real message type, the way
/// fragment reassembly already tags a fragment's `original_type` - a chat
/// message, delivery ack, and read receipt all travel inside the same
/// `NoiseEncrypted` wire packet and need a marker to tell them apart once
/// decrypted.
fn encode_encrypted_envelope(inner_type: MessageType, inner_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + inner_payload.len());
    out.push(inner_type as u8);
    out.extend_from_slice(inner_payload);
    out
}

fn decode_encrypted_envelope(bytes: &[u8]) -> Option<(MessageType, &[u8])> {
    let (&tag, rest) = bytes.split_first()?;
    let inner_type = MessageType::try_from(tag).ok()?;
    Some((inner_type, rest))
}

/// Build the wire packet(s) for an originated payload, fragmenting into
/// `FragmentStart`/`FragmentContinue`/`FragmentEnd` packets if it's too
/// large for a single packet.
fn build_outbound_packets(
    message_type: MessageType,
    self_id: PeerId,
    recipient: Option<PeerId>,
    ttl: u8,
    timestamp: u64,
    payload: Vec<u8>,
) -> Vec<Packet> {
    let Some(fragments) = fragment::split(message_type as u8, &payload) else {
        let mut builder = PacketBuilder::new(message_type, self_id.as_bytes(), ttl).timestamp(timestamp);
        if let Some(to) = recipient {
            builder = builder.recipient(to.as_bytes());
        }
        return vec![builder.payload(payload).build()];
    };

    fragments
        .into_iter()
        .map(|f| {
            let fragment_type = if f.index == 0 {
                MessageType::FragmentStart
            } else if f.index + 1 == f.total {
                MessageType::FragmentEnd
            } else {
                MessageType::FragmentContinue
            };
            let mut body = Vec::with_capacity(13 + f.slice.len());
            body.extend_from_slice(&f.fragment_id);
            body.extend_from_slice(&f.index.to_be_bytes());
            body.extend_from_slice(&f.total.to_be_bytes());
            body.push(f.original_type);
            body.extend_from_slice(&f.slice);

            let mut builder = PacketBuilder::new(fragment_type, self_id.as_bytes(), ttl).timestamp(timestamp);
            if let Some(to) = recipient {
                builder = builder.recipient(to.as_bytes());
            }
            builder.payload(body).build()
        })
        .collect()
}

fn encode_version_hello(hello: &VersionHello) -> Vec<u8> {
    let mut out = vec![hello.preferred, hello.supported.len() as u8];
    out.extend_from_slice(&hello.supported);
    out
}

fn decode_version_hello(bytes: &[u8]) -> Option<VersionHello> {
    let (preferred, count) = (*bytes.first()?, *bytes.get(1)? as usize);
    let supported = bytes.get(2..2 + count)?.to_vec();
    Some(VersionHello { supported, preferred })
}

fn encode_version_ack(ack: &VersionAck) -> Vec<u8> {
    match ack.agreed {
        Some(v) => vec![1, v],
        None => vec![0, ack.rejected.unwrap_or(0)],
    }
}

fn decode_version_ack(bytes: &[u8]) -> Option<VersionAck> {
    let flag = *bytes.first()?;
    let version = *bytes.get(1)?;
    Some(if flag == 1 {
        VersionAck::agree(version)
    } else {
        VersionAck::reject(version, "peer rejected version")
    })
}

/// Wire form of the §3 identity binding record: `{peerID, fingerprint,
/// staticPubKey, nickname, timestamp, signature}`. `nickname` is
/// length-prefixed since it's the one variable-length field.
fn encode_identity_announce(announce: &IdentityAnnounce) -> Vec<u8> {
    let nickname_bytes = announce.nickname.as_bytes();
    let mut out = Vec::with_capacity(PEER_ID_SIZE + 32 + 32 + 32 + 2 + nickname_bytes.len() + 8 + 64);
    out.extend_from_slice(&announce.peer_id.as_bytes());
    out.extend_from_slice(announce.fingerprint.as_bytes());
    out.extend_from_slice(&announce.signing_public_key.to_bytes());
    out.extend_from_slice(&announce.static_public_key);
    out.extend_from_slice(&(nickname_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(nickname_bytes);
    out.extend_from_slice(&announce.timestamp.to_be_bytes());
    out.extend_from_slice(announce.signature.as_bytes());
    out
}

fn decode_identity_announce(bytes: &[u8]) -> Option<IdentityAnnounce> {
    const FIXED_LEN: usize = PEER_ID_SIZE + 32 + 32 + 32 + 2 + 8 + 64;
    if bytes.len() < FIXED_LEN {
        return None;
    }
    let mut pos = 0;
    let peer_id = PeerId::from_bytes(bytes[pos..pos + PEER_ID_SIZE].try_into().ok()?);
    pos += PEER_ID_SIZE;
    let fingerprint_bytes: [u8; 32] = bytes[pos..pos + 32].try_into().ok()?;
    let fingerprint = Fingerprint::from_digest(fingerprint_bytes);
    pos += 32;
    let key_bytes: [u8; 32] = bytes[pos..pos + 32].try_into().ok()?;
    let signing_public_key = bitchat_crypto::signatures::VerifyingKey::from_bytes(&key_bytes).ok()?;
    pos += 32;
    let static_public_key: [u8; 32] = bytes[pos..pos + 32].try_into().ok()?;
    pos += 32;
    let nickname_len = u16::from_be_bytes(bytes[pos..pos + 2].try_into().ok()?) as usize;
    pos += 2;
    if bytes.len() != FIXED_LEN + nickname_len {
        return None;
    }
    let nickname = String::from_utf8(bytes[pos..pos + nickname_len].to_vec()).ok()?;
    pos += nickname_len;
    let timestamp = u64::from_be_bytes(bytes[pos..pos + 8].try_into().ok()?);
    pos += 8;
    let sig_bytes: [u8; 64] = bytes[pos..].try_into().ok()?;
    let signature = bitchat_crypto::signatures::Signature::from_bytes(sig_bytes);
    Some(IdentityAnnounce {
        peer_id,
        signing_public_key,
        static_public_key,
        fingerprint,
        nickname,
        timestamp,
        signature,
    })
}

fn encode_delivery_ack(ack: &DeliveryAck) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + PEER_ID_SIZE + 1);
    out.extend_from_slice(&ack.ack_id);
    out.extend_from_slice(&ack.original_message_id);
    out.extend_from_slice(&ack.recipient_id.as_bytes());
    out.push(ack.hop_count);
    out
}

fn decode_delivery_ack(bytes: &[u8]) -> Option<DeliveryAck> {
    if bytes.len() != 8 + 8 + PEER_ID_SIZE + 1 {
        return None;
    }
    Some(DeliveryAck {
        ack_id: bytes[0..8].try_into().ok()?,
        original_message_id: bytes[8..16].try_into().ok()?,
        recipient_id: PeerId::from_bytes(bytes[16..16 + PEER_ID_SIZE].try_into().ok()?),
        hop_count: bytes[16 + PEER_ID_SIZE],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TokioMutex;

    struct NullDelegate;
    impl MeshDelegate for NullDelegate {
        fn on_message_received(&self, _: PeerId, _: MessageType, _: Option<[u8; 8]>, _: &[u8]) {}
        fn on_peer_connected(&self, _: PeerId) {}
        fn on_peer_disconnected(&self, _: PeerId) {}
        fn on_peer_list_changed(&self, _: &[PeerId]) {}
        fn on_delivery_ack(&self, _: DeliveryAck) {}
        fn on_read_receipt(&self, _: [u8; 8], _: PeerId) {}
        fn on_identity_bound(&self, _: PeerId, _: Fingerprint) {}
        fn is_favorite(&self, _: Fingerprint) -> bool {
            false
        }
        fn decrypt_channel_message(&self, _: &[u8], _: &str) -> Option<Vec<u8>> {
            None
        }
    }

    struct RecordingBackend {
        sent: TokioMutex<Vec<(PeerId, Vec<u8>)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BleBackend for RecordingBackend {
        async fn send(&self, peer_id: PeerId, bytes: Vec<u8>, _: WriteKind) -> Result<(), RouterError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.sent.lock().await.push((peer_id, bytes));
            Ok(())
        }
    }

    fn test_node() -> Node {
        let backend = Arc::new(RecordingBackend {
            sent: TokioMutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        Node::new(NodeConfig::default(), backend, Arc::new(NullDelegate)).unwrap()
    }

    #[tokio::test]
    async fn node_generates_stable_identity() {
        let node = test_node();
        let fp1 = node.fingerprint().await;
        let fp2 = node.fingerprint().await;
        assert_eq!(fp1, fp2);
    }

    #[tokio::test]
    async fn version_hello_roundtrips_through_encode_decode() {
        let hello = VersionHello::ours();
        let bytes = encode_version_hello(&hello);
        let decoded = decode_version_hello(&bytes).unwrap();
        assert_eq!(decoded, hello);
    }

    #[tokio::test]
    async fn malformed_packet_bytes_are_rejected() {
        let node = test_node();
        let from = PeerId::from_bytes([1; 8]);
        let result = node.handle_inbound(from, &[0u8; 3]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn peer_connect_then_disconnect_updates_router() {
        let node = test_node();
        let peer = PeerId::from_bytes([2; 8]);
        node.handle_peer_connected(peer).await;
        assert_eq!(node.router.lock().await.active_peer_count(), 1);
        node.handle_peer_disconnected(peer).await;
        assert_eq!(node.router.lock().await.active_peer_count(), 0);
    }

    #[test]
    fn delivery_ack_roundtrips() {
        let ack = DeliveryAck {
            ack_id: [1; 8],
            original_message_id: [2; 8],
            recipient_id: PeerId::from_bytes([3; 8]),
            hop_count: 2,
        };
        let bytes = encode_delivery_ack(&ack);
        let decoded = decode_delivery_ack(&bytes).unwrap();
        assert_eq!(decoded, ack);
    }
}
