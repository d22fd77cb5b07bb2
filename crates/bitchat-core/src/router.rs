//! Mesh routing: relay decisions, duplicate suppression, store-and-forward,
//! and cover traffic for the BLE mesh.
//!
//! This module holds the pure decision logic. The task that owns a live
//! `Router` (the "mesh queue" of the concurrency model) drives it from
//! packets arriving over the transport and applies the jitter/relay actions
//! it returns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bitchat_crypto::Fingerprint;
use rand::Rng;

use crate::dup_filter::{DuplicateFilter, MessageId};
use crate::fragment::Reassembler;
use crate::identity::PeerId;
use crate::packet::{Packet, PEER_ID_SIZE};

/// Packets older or newer than this relative to local wall-clock are dropped.
pub const REPLAY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Fixed plaintext prefix marking a cover-traffic message, silently discarded
/// by the receiver rather than surfaced to the application.
pub const COVER_TRAFFIC_MARKER: &[u8] = b"\0BCOVER\0";

/// Favorite per-recipient store-and-forward queue depth.
const FAVORITE_QUEUE_DEPTH: usize = 1000;

/// Combined non-favorite store-and-forward depth, across all recipients.
const NON_FAVORITE_QUEUE_DEPTH: usize = 100;

/// How long a stored message is held before being dropped unsent.
const STORE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Spacing between messages flushed from a recipient's store-and-forward queue.
pub const FLUSH_SPACING: Duration = Duration::from_millis(20);

/// Why an inbound packet was dropped before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// TTL had already reached zero.
    ExpiredTtl,
    /// Payload was empty.
    EmptyPayload,
    /// Packet timestamp is outside the replay window.
    ReplayWindow,
    /// Packet identity already seen.
    Duplicate,
}

/// A packet queued for relay, plus the jitter to wait before emitting it.
#[derive(Debug, Clone)]
pub struct RelayPlan {
    /// The packet to emit, already carrying its decremented TTL.
    pub packet: Packet,
    /// Uniform random delay in `[10ms, 100ms]` to spread collisions.
    pub jitter: Duration,
}

/// What to do with an inbound packet, per component C8's dispatch rule.
pub enum Disposition {
    /// Addressed to us; not relayed further.
    Deliver(Packet),
    /// Broadcast or recipient-less; delivered up and considered for relay.
    DeliverAndRelay(Packet, Option<RelayPlan>),
    /// Addressed to someone else; relay-only, never delivered up.
    RelayOnly(Option<RelayPlan>),
    /// Dropped before dispatch.
    Drop(DropReason),
}

/// Relay probability for a non-private packet given `n` active peers.
#[must_use]
pub fn base_relay_probability(active_peers: usize) -> f64 {
    match active_peers {
        0..=10 => 1.0,
        11..=30 => 0.85,
        31..=50 => 0.7,
        51..=100 => 0.55,
        _ => 0.4,
    }
}

/// Relay probability adjusted for private (+0.15, capped at 1.0) vs broadcast traffic.
#[must_use]
pub fn relay_probability(active_peers: usize, is_private: bool) -> f64 {
    let base = base_relay_probability(active_peers);
    if is_private { (base + 0.15).min(1.0) } else { base }
}

/// TTL assigned to a packet this node originates, scaled to mesh size.
#[must_use]
pub fn adaptive_ttl(active_peers: usize) -> u8 {
    match active_peers {
        0..=20 => 6,
        21..=50 => 5,
        51..=100 => 4,
        _ => 3,
    }
}

/// Whether to relay a packet whose TTL has already been decremented to `ttl_after`.
///
/// Unconditional relay if the packet still has plenty of hops left
/// (`ttl_after >= 4`) or the mesh is so sparse relaying is basically free
/// (`active_peers <= 3`); otherwise a probabilistic decision.
pub fn should_relay(
    ttl_after: u8,
    active_peers: usize,
    is_private: bool,
    rng: &mut impl Rng,
) -> bool {
    if ttl_after >= 4 || active_peers <= 3 {
        return true;
    }
    rng.gen_bool(relay_probability(active_peers, is_private))
}

/// A uniform random jitter in `[10ms, 100ms]`.
pub fn relay_jitter(rng: &mut impl Rng) -> Duration {
    Duration::from_millis(rng.gen_range(10..=100))
}

struct StoredMessage {
    message_id: [u8; 8],
    packet: Packet,
    stored_at: Instant,
}

/// Tracks which message ids have already been flushed from store-and-forward,
/// so a peer reconnecting mid-flush never gets the same message twice.
#[derive(Default)]
struct FlushedIds(HashSet<[u8; 8]>);

/// Core mesh routing state: duplicate suppression, fragment reassembly,
/// active-peer bookkeeping, favorites, and store-and-forward.
pub struct Router {
    self_peer_id: PeerId,
    dup_filter: DuplicateFilter,
    reassembler: Reassembler,
    active_peers: HashSet<PeerId>,
    favorites: HashSet<Fingerprint>,
    offline_favorites: HashSet<Fingerprint>,
    store_and_forward: HashMap<Fingerprint, VecDeque<StoredMessage>>,
    flushed: FlushedIds,
}

impl Router {
    /// Create a router for a node identified by `self_peer_id`.
    #[must_use]
    pub fn new(self_peer_id: PeerId) -> Self {
        Self {
            self_peer_id,
            dup_filter: DuplicateFilter::new(0),
            reassembler: Reassembler::new(),
            active_peers: HashSet::new(),
            favorites: HashSet::new(),
            offline_favorites: HashSet::new(),
            store_and_forward: HashMap::new(),
            flushed: FlushedIds::default(),
        }
    }

    /// Number of peers currently considered active, for TTL/probability scaling.
    #[must_use]
    pub fn active_peer_count(&self) -> usize {
        self.active_peers.len()
    }

    /// Snapshot of the currently active peer-ids, for broadcast fan-out.
    #[must_use]
    pub fn active_peer_ids(&self) -> Vec<PeerId> {
        self.active_peers.iter().copied().collect()
    }

    /// Mark `peer_id` connected and reachable.
    pub fn peer_connected(&mut self, peer_id: PeerId) {
        self.active_peers.insert(peer_id);
        self.dup_filter.set_active_peers_hint(self.active_peers.len());
    }

    /// Mark `peer_id` disconnected.
    pub fn peer_disconnected(&mut self, peer_id: PeerId) {
        self.active_peers.remove(&peer_id);
        self.dup_filter.set_active_peers_hint(self.active_peers.len());
    }

    /// Mark a fingerprint as a favorite (eligible for store-and-forward and retry).
    pub fn mark_favorite(&mut self, fingerprint: Fingerprint) {
        self.favorites.insert(fingerprint);
    }

    /// Whether `fingerprint` is a favorite.
    #[must_use]
    pub fn is_favorite(&self, fingerprint: Fingerprint) -> bool {
        self.favorites.contains(&fingerprint)
    }

    /// Mark a favorite as currently offline (store-and-forward becomes active for it).
    pub fn mark_offline(&mut self, fingerprint: Fingerprint) {
        self.offline_favorites.insert(fingerprint);
    }

    /// Whether `payload` is a cover-traffic filler to be silently discarded.
    #[must_use]
    pub fn is_cover_traffic(payload: &[u8]) -> bool {
        payload.starts_with(COVER_TRAFFIC_MARKER)
    }

    /// Process one inbound packet per the receive pipeline: replay/duplicate
    /// filtering, delivery/relay classification, and relay-probability.
    pub fn ingest(&mut self, packet: Packet, now_ms: u64, rng: &mut impl Rng) -> Disposition {
        if packet.ttl() == 0 {
            return Disposition::Drop(DropReason::ExpiredTtl);
        }
        if packet.payload().is_empty() {
            return Disposition::Drop(DropReason::EmptyPayload);
        }
        if now_ms.abs_diff(packet.timestamp()) > REPLAY_WINDOW_MS {
            return Disposition::Drop(DropReason::ReplayWindow);
        }

        let id = MessageId::of(&packet);
        if !self.dup_filter.insert(id) {
            return Disposition::Drop(DropReason::Duplicate);
        }

        let addressed_to_self = packet
            .recipient_id()
            .is_some_and(|r| r == self.self_peer_id.as_bytes());
        let is_broadcast = packet.is_broadcast();

        if addressed_to_self {
            return Disposition::Deliver(packet);
        }

        let Some(ttl_after) = packet.decremented_ttl() else {
            return if is_broadcast {
                Disposition::DeliverAndRelay(packet, None)
            } else {
                Disposition::RelayOnly(None)
            };
        };

        let is_private = !is_broadcast;
        let plan = should_relay(ttl_after, self.active_peer_count(), is_private, rng).then(|| {
            RelayPlan {
                packet: packet.with_ttl(ttl_after),
                jitter: relay_jitter(rng),
            }
        });

        if is_broadcast {
            Disposition::DeliverAndRelay(packet, plan)
        } else {
            Disposition::RelayOnly(plan)
        }
    }

    /// Feed one fragment slice through reassembly.
    ///
    /// # Errors
    ///
    /// Propagates `SessionError::FragmentOverflow` from the reassembler.
    pub fn ingest_fragment(
        &mut self,
        fragment: crate::fragment::Fragment,
    ) -> Result<Option<(u8, Vec<u8>)>, crate::error::SessionError> {
        self.reassembler.accept(fragment)
    }

    /// Plan the outbound relay parameters for a packet this node originates:
    /// the adaptive TTL for the current mesh size. Our own sends always go
    /// out; only relays of others' packets are probabilistic.
    #[must_use]
    pub fn originate_ttl(&self) -> u8 {
        adaptive_ttl(self.active_peer_count())
    }

    /// Cache a private message for a favorite recipient that's currently offline.
    ///
    /// No-op for broadcast packets or non-favorite/online recipients - callers
    /// should check [`Router::is_favorite`] and offline status before calling.
    pub fn store_for_offline_favorite(
        &mut self,
        fingerprint: Fingerprint,
        message_id: [u8; 8],
        packet: Packet,
    ) {
        if packet.is_broadcast() {
            return;
        }
        let queue = self.store_and_forward.entry(fingerprint).or_default();
        if queue.len() >= FAVORITE_QUEUE_DEPTH {
            queue.pop_front();
        }
        queue.push_back(StoredMessage {
            message_id,
            packet,
            stored_at: Instant::now(),
        });
        self.enforce_global_cap();
    }

    fn enforce_global_cap(&mut self) {
        let favorites = &self.favorites;
        let total_non_favorite: usize = self
            .store_and_forward
            .iter()
            .filter(|(fp, _)| !favorites.contains(fp))
            .map(|(_, q)| q.len())
            .sum();
        if total_non_favorite <= NON_FAVORITE_QUEUE_DEPTH {
            return;
        }
        let mut overflow = total_non_favorite - NON_FAVORITE_QUEUE_DEPTH;
        for (fp, queue) in &mut self.store_and_forward {
            if favorites.contains(fp) {
                continue;
            }
            while overflow > 0 {
                if queue.pop_front().is_none() {
                    break;
                }
                overflow -= 1;
            }
            if overflow == 0 {
                break;
            }
        }
    }

    /// A peer with `fingerprint` became reachable: drain its store-and-forward
    /// queue in original timestamp order, dropping expired and already-flushed
    /// entries. Callers are expected to space emission by [`FLUSH_SPACING`].
    pub fn flush_for(&mut self, fingerprint: Fingerprint) -> Vec<Packet> {
        self.offline_favorites.remove(&fingerprint);
        let Some(mut queue) = self.store_and_forward.remove(&fingerprint) else {
            return Vec::new();
        };

        let mut entries: Vec<StoredMessage> = queue.drain(..).collect();
        entries.retain(|m| m.stored_at.elapsed() < STORE_TTL);
        entries.sort_by_key(|m| m.packet.timestamp());

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.flushed.0.insert(entry.message_id) {
                out.push(entry.packet);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageType, PacketBuilder};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 8])
    }

    fn broadcast_packet(ttl: u8, ts: u64) -> Packet {
        PacketBuilder::new(MessageType::Message, [1; PEER_ID_SIZE], ttl)
            .timestamp(ts)
            .payload(b"hi".to_vec())
            .build()
    }

    #[test]
    fn zero_ttl_is_dropped() {
        let mut router = Router::new(peer(0));
        let mut rng = StdRng::seed_from_u64(1);
        let packet = broadcast_packet(0, 1000);
        assert!(matches!(
            router.ingest(packet, 1000, &mut rng),
            Disposition::Drop(DropReason::ExpiredTtl)
        ));
    }

    #[test]
    fn stale_timestamp_is_dropped() {
        let mut router = Router::new(peer(0));
        let mut rng = StdRng::seed_from_u64(1);
        let packet = broadcast_packet(5, 1000);
        let far_future = 1000 + REPLAY_WINDOW_MS + 1;
        assert!(matches!(
            router.ingest(packet, far_future, &mut rng),
            Disposition::Drop(DropReason::ReplayWindow)
        ));
    }

    #[test]
    fn duplicate_packet_is_dropped_on_second_sighting() {
        let mut router = Router::new(peer(0));
        let mut rng = StdRng::seed_from_u64(1);
        let packet = broadcast_packet(5, 1000);

        let first = router.ingest(packet.clone(), 1000, &mut rng);
        assert!(!matches!(first, Disposition::Drop(_)));

        let second = router.ingest(packet, 1000, &mut rng);
        assert!(matches!(
            second,
            Disposition::Drop(DropReason::Duplicate)
        ));
    }

    #[test]
    fn broadcast_is_delivered_and_considered_for_relay() {
        let mut router = Router::new(peer(0));
        let mut rng = StdRng::seed_from_u64(1);
        let packet = broadcast_packet(5, 1000);
        match router.ingest(packet, 1000, &mut rng) {
            Disposition::DeliverAndRelay(_, _) => {}
            _ => panic!("expected DeliverAndRelay"),
        }
    }

    #[test]
    fn packet_addressed_to_self_is_delivered_only() {
        let mut router = Router::new(peer(9));
        let mut rng = StdRng::seed_from_u64(1);
        let packet = PacketBuilder::new(MessageType::Message, [1; PEER_ID_SIZE], 5)
            .timestamp(1000)
            .recipient(peer(9).as_bytes())
            .payload(b"hi".to_vec())
            .build();
        assert!(matches!(
            router.ingest(packet, 1000, &mut rng),
            Disposition::Deliver(_)
        ));
    }

    #[test]
    fn packet_for_other_peer_is_relay_only() {
        let mut router = Router::new(peer(9));
        let mut rng = StdRng::seed_from_u64(1);
        let packet = PacketBuilder::new(MessageType::Message, [1; PEER_ID_SIZE], 5)
            .timestamp(1000)
            .recipient(peer(2).as_bytes())
            .payload(b"hi".to_vec())
            .build();
        assert!(matches!(
            router.ingest(packet, 1000, &mut rng),
            Disposition::RelayOnly(_)
        ));
    }

    #[test]
    fn sparse_mesh_always_relays() {
        assert!(base_relay_probability(5) >= base_relay_probability(1000));
        let mut rng = StdRng::seed_from_u64(42);
        assert!(should_relay(1, 2, false, &mut rng));
    }

    #[test]
    fn high_ttl_remainder_always_relays() {
        let mut rng = StdRng::seed_from_u64(42);
        assert!(should_relay(4, 1000, false, &mut rng));
    }

    #[test]
    fn adaptive_ttl_shrinks_with_mesh_size() {
        assert_eq!(adaptive_ttl(5), 6);
        assert_eq!(adaptive_ttl(30), 5);
        assert_eq!(adaptive_ttl(75), 4);
        assert_eq!(adaptive_ttl(500), 3);
    }

    #[test]
    fn cover_traffic_marker_is_recognized() {
        let mut payload = COVER_TRAFFIC_MARKER.to_vec();
        payload.extend_from_slice(b"padding");
        assert!(Router::is_cover_traffic(&payload));
        assert!(!Router::is_cover_traffic(b"real message"));
    }

    #[test]
    fn store_and_forward_flushes_in_timestamp_order() {
        let mut router = Router::new(peer(0));
        let fp = Fingerprint::of(&[7u8; 32]);
        router.mark_favorite(fp);

        let later = PacketBuilder::new(MessageType::Message, [1; PEER_ID_SIZE], 5)
            .timestamp(2000)
            .recipient(peer(3).as_bytes())
            .payload(b"second".to_vec())
            .build();
        let earlier = PacketBuilder::new(MessageType::Message, [1; PEER_ID_SIZE], 5)
            .timestamp(1000)
            .recipient(peer(3).as_bytes())
            .payload(b"first".to_vec())
            .build();

        router.store_for_offline_favorite(fp, [1; 8], later);
        router.store_for_offline_favorite(fp, [2; 8], earlier);

        let flushed = router.flush_for(fp);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].payload(), b"first");
        assert_eq!(flushed[1].payload(), b"second");
    }

    #[test]
    fn flush_does_not_redeliver_same_message_id() {
        let mut router = Router::new(peer(0));
        let fp = Fingerprint::of(&[8u8; 32]);
        router.mark_favorite(fp);

        let packet = PacketBuilder::new(MessageType::Message, [1; PEER_ID_SIZE], 5)
            .timestamp(1000)
            .recipient(peer(3).as_bytes())
            .payload(b"once".to_vec())
            .build();
        router.store_for_offline_favorite(fp, [9; 8], packet.clone());
        let first_flush = router.flush_for(fp);
        assert_eq!(first_flush.len(), 1);

        router.store_for_offline_favorite(fp, [9; 8], packet);
        let second_flush = router.flush_for(fp);
        assert!(second_flush.is_empty());
    }

    #[test]
    fn broadcast_packets_are_never_stored() {
        let mut router = Router::new(peer(0));
        let fp = Fingerprint::of(&[9u8; 32]);
        router.mark_favorite(fp);
        let packet = broadcast_packet(5, 1000);
        router.store_for_offline_favorite(fp, [1; 8], packet);
        assert!(router.flush_for(fp).is_empty());
    }
}
