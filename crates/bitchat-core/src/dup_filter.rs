//! Duplicate packet detection.
//!
//! Combines an adaptive Bloom filter (fast negative answers, no false
//! negatives) with a small bounded exact set that resolves Bloom's false
//! positives. The Bloom filter is replaced on a fixed interval so its false
//! positive rate doesn't creep up as the mesh accumulates history.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bloomfilter::Bloom;
use sha2::{Digest, Sha256};

use crate::packet::{Packet, PEER_ID_SIZE};

/// How often the Bloom filter is rebuilt from scratch.
pub const RESET_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Floor for the Bloom filter's expected-item sizing.
const MIN_EXPECTED_ITEMS: usize = 2000;

/// Target false-positive rate for the Bloom filter.
const TARGET_FP_RATE: f64 = 0.01;

/// Capacity of the exact verification set.
const EXACT_SET_CAPACITY: usize = 1000;

/// Identity of a message for duplicate-detection purposes.
///
/// Fragments fold their message type in so that `FragmentStart`,
/// `FragmentContinue`, and `FragmentEnd` for the same logical message are
/// treated as distinct entries rather than colliding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    timestamp: u64,
    sender_id: [u8; PEER_ID_SIZE],
    message_type: u8,
    payload_prefix_hash: [u8; 32],
}

impl MessageId {
    /// Derive the duplicate-detection identity of a decoded packet.
    #[must_use]
    pub fn of(packet: &Packet) -> Self {
        let prefix_len = packet.payload().len().min(64);
        let digest = Sha256::digest(&packet.payload()[..prefix_len]);
        let mut payload_prefix_hash = [0u8; 32];
        payload_prefix_hash.copy_from_slice(&digest);

        Self {
            timestamp: packet.timestamp(),
            sender_id: packet.sender_id(),
            message_type: packet.message_type() as u8,
            payload_prefix_hash,
        }
    }

    fn as_bloom_key(&self) -> [u8; 8 + PEER_ID_SIZE + 1 + 32] {
        let mut buf = [0u8; 8 + PEER_ID_SIZE + 1 + 32];
        buf[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..8 + PEER_ID_SIZE].copy_from_slice(&self.sender_id);
        buf[8 + PEER_ID_SIZE] = self.message_type;
        buf[8 + PEER_ID_SIZE + 1..].copy_from_slice(&self.payload_prefix_hash);
        buf
    }
}

/// Adaptive Bloom + bounded exact-set duplicate filter.
pub struct DuplicateFilter {
    bloom: Bloom<[u8; 8 + PEER_ID_SIZE + 1 + 32]>,
    bloom_since: Instant,
    exact: VecDeque<MessageId>,
    active_peers_hint: usize,
}

impl DuplicateFilter {
    /// Build a filter sized for an initial estimate of `active_peers`.
    #[must_use]
    pub fn new(active_peers: usize) -> Self {
        Self {
            bloom: Self::build_bloom(active_peers),
            bloom_since: Instant::now(),
            exact: VecDeque::with_capacity(EXACT_SET_CAPACITY),
            active_peers_hint: active_peers,
        }
    }

    fn build_bloom(active_peers: usize) -> Bloom<[u8; 8 + PEER_ID_SIZE + 1 + 32]> {
        let expected = MIN_EXPECTED_ITEMS.max(2 * active_peers);
        Bloom::new_for_fp_rate(expected, TARGET_FP_RATE)
    }

    /// Refresh the active-peer-count hint used when the Bloom is next reset.
    pub fn set_active_peers_hint(&mut self, active_peers: usize) {
        self.active_peers_hint = active_peers;
    }

    /// Reset the Bloom filter if the rebuild interval has elapsed.
    pub fn maybe_reset(&mut self) {
        if self.bloom_since.elapsed() >= RESET_INTERVAL {
            self.bloom = Self::build_bloom(self.active_peers_hint);
            self.bloom_since = Instant::now();
        }
    }

    /// Check whether `id` has already been seen, without recording it.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        if !self.bloom.check(&id.as_bloom_key()) {
            return false;
        }
        self.exact.contains(id)
    }

    /// Record `id` as seen. Returns `true` if it was newly inserted (not a
    /// duplicate), `false` if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.maybe_reset();

        if self.contains(&id) {
            return false;
        }

        self.bloom.set(&id.as_bloom_key());
        if self.exact.len() >= EXACT_SET_CAPACITY {
            self.exact.pop_front();
        }
        self.exact.push_back(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageType, PacketBuilder};

    fn make_packet(sender: [u8; PEER_ID_SIZE], timestamp: u64, payload: &[u8]) -> Packet {
        PacketBuilder::new(MessageType::Message, sender, 5)
            .timestamp(timestamp)
            .payload(payload.to_vec())
            .build()
    }

    #[test]
    fn first_sighting_is_not_duplicate() {
        let mut filter = DuplicateFilter::new(10);
        let id = MessageId::of(&make_packet([1; PEER_ID_SIZE], 1000, b"hi"));
        assert!(filter.insert(id));
    }

    #[test]
    fn repeated_sighting_is_duplicate() {
        let mut filter = DuplicateFilter::new(10);
        let id = MessageId::of(&make_packet([1; PEER_ID_SIZE], 1000, b"hi"));
        assert!(filter.insert(id));
        assert!(!filter.insert(id));
        assert!(filter.contains(&id));
    }

    #[test]
    fn different_payloads_are_distinct() {
        let mut filter = DuplicateFilter::new(10);
        let a = MessageId::of(&make_packet([1; PEER_ID_SIZE], 1000, b"hi"));
        let b = MessageId::of(&make_packet([1; PEER_ID_SIZE], 1000, b"bye"));
        assert!(filter.insert(a));
        assert!(filter.insert(b));
    }

    #[test]
    fn exact_set_evicts_oldest_past_capacity() {
        let mut filter = DuplicateFilter::new(10);
        for i in 0..(EXACT_SET_CAPACITY + 10) {
            let id = MessageId::of(&make_packet([1; PEER_ID_SIZE], i as u64, b"x"));
            filter.insert(id);
        }
        assert_eq!(filter.exact.len(), EXACT_SET_CAPACITY);
    }
}
