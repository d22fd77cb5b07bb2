//! Delivery tracking for outbound user messages.
//!
//! Tracks each outbound message from `Sending` through to a terminal state,
//! mints and deduplicates `DeliveryAck`/`ReadReceipt` packets, and decides
//! when a channel message has enough acknowledging recipients to count as
//! delivered.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Timeout for a private (1:1) message before it's marked `Failed`.
pub const PRIVATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a channel message.
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for a private message to a favorite peer (retried, so longer-lived).
pub const FAVORITE_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum retry attempts for a favorite private message.
pub const MAX_RETRIES: u8 = 3;

/// Lifecycle state of a tracked outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Handed to the router, not yet relayed.
    Sending,
    /// Relayed onto the mesh at least once.
    Sent,
    /// All expected recipients acknowledged.
    Delivered,
    /// Some, but not enough, expected recipients acknowledged.
    PartiallyDelivered,
    /// The recipient opened the message (private messages only).
    Read,
    /// Timed out with insufficient acknowledgment.
    Failed,
}

/// Acknowledgment of receipt for a previously sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    /// Identifier of this ack, for duplicate suppression.
    pub ack_id: [u8; 8],
    /// Message this ack refers to.
    pub original_message_id: [u8; 8],
    /// Peer-id of the acknowledging recipient.
    pub recipient_id: PeerId,
    /// Number of mesh hops the ack has traveled, for diagnostics.
    pub hop_count: u8,
}

/// A tracked outbound message and its delivery bookkeeping.
pub struct DeliveryRecord {
    message_id: [u8; 8],
    sent_at: Instant,
    is_channel: bool,
    is_favorite: bool,
    expected_recipients: usize,
    acked_by: HashSet<PeerId>,
    read_by: HashSet<PeerId>,
    retries: u8,
    state: DeliveryState,
}

impl DeliveryRecord {
    fn timeout(&self) -> Duration {
        if self.is_favorite {
            FAVORITE_TIMEOUT
        } else if self.is_channel {
            CHANNEL_TIMEOUT
        } else {
            PRIVATE_TIMEOUT
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Number of send attempts made so far (favorites only retry).
    #[must_use]
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Whether this record's timeout has been reached without settling.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(
            self.state,
            DeliveryState::Sending | DeliveryState::Sent | DeliveryState::PartiallyDelivered
        ) && self.sent_at.elapsed() >= self.timeout()
    }

    /// Whether a favorite message that timed out still has retries left.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.is_favorite && self.retries < MAX_RETRIES
    }

    fn recompute_channel_state(&mut self) {
        let required = 1.max(self.expected_recipients.div_ceil(2));
        if self.acked_by.len() >= required {
            self.state = DeliveryState::Delivered;
        } else if !self.acked_by.is_empty() {
            self.state = DeliveryState::PartiallyDelivered;
        }
    }
}

/// Tracks all in-flight delivery records and applies incoming acks/receipts.
#[derive(Default)]
pub struct DeliveryTracker {
    records: HashMap<[u8; 8], DeliveryRecord>,
    seen_acks: HashSet<[u8; 8]>,
}

impl DeliveryTracker {
    /// Begin tracking a freshly sent message.
    pub fn track(
        &mut self,
        message_id: [u8; 8],
        is_channel: bool,
        is_favorite: bool,
        expected_recipients: usize,
    ) {
        self.records.insert(
            message_id,
            DeliveryRecord {
                message_id,
                sent_at: Instant::now(),
                is_channel,
                is_favorite,
                expected_recipients: expected_recipients.max(1),
                acked_by: HashSet::new(),
                read_by: HashSet::new(),
                retries: 0,
                state: DeliveryState::Sending,
            },
        );
    }

    /// Mark a tracked message as having been relayed at least once.
    pub fn mark_sent(&mut self, message_id: [u8; 8]) {
        if let Some(record) = self.records.get_mut(&message_id)
            && record.state == DeliveryState::Sending
        {
            record.state = DeliveryState::Sent;
        }
    }

    /// Record a retry attempt for a favorite message that timed out.
    pub fn mark_retried(&mut self, message_id: [u8; 8]) {
        if let Some(record) = self.records.get_mut(&message_id) {
            record.retries += 1;
            record.sent_at = Instant::now();
            record.state = DeliveryState::Sending;
        }
    }

    /// Apply an inbound ack. Returns `false` if it was a duplicate or the
    /// message isn't tracked.
    pub fn apply_ack(&mut self, ack: &DeliveryAck) -> bool {
        if !self.seen_acks.insert(ack.ack_id) {
            return false;
        }
        let Some(record) = self.records.get_mut(&ack.original_message_id) else {
            return false;
        };

        record.acked_by.insert(ack.recipient_id);
        if record.is_channel {
            record.recompute_channel_state();
        } else {
            record.state = DeliveryState::Delivered;
        }
        true
    }

    /// Apply an inbound read receipt (private messages only).
    pub fn apply_read_receipt(&mut self, message_id: [u8; 8], reader: PeerId) -> bool {
        let Some(record) = self.records.get_mut(&message_id) else {
            return false;
        };
        if !record.is_channel {
            record.read_by.insert(reader);
            record.state = DeliveryState::Read;
            true
        } else {
            false
        }
    }

    /// Sweep for timed-out records, marking non-retryable ones `Failed` and
    /// returning the message-ids of favorites still eligible for retry.
    pub fn sweep_timeouts(&mut self) -> Vec<[u8; 8]> {
        let mut retry_candidates = Vec::new();
        for record in self.records.values_mut() {
            if !record.is_timed_out() {
                continue;
            }
            if record.can_retry() {
                retry_candidates.push(record.message_id);
            } else {
                record.state = DeliveryState::Failed;
            }
        }
        retry_candidates
    }

    /// Look up a record's current state.
    #[must_use]
    pub fn state_of(&self, message_id: [u8; 8]) -> Option<DeliveryState> {
        self.records.get(&message_id).map(DeliveryRecord::state)
    }

    /// Drop settled (terminal-state) records older than their timeout, to
    /// bound memory use.
    pub fn prune_settled(&mut self) {
        self.records.retain(|_, record| {
            !matches!(
                record.state,
                DeliveryState::Delivered | DeliveryState::Read | DeliveryState::Failed
            ) || record.sent_at.elapsed() < record.timeout() * 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 8])
    }

    fn ack(ack_id: u8, message_id: [u8; 8], recipient: PeerId) -> DeliveryAck {
        DeliveryAck {
            ack_id: [ack_id; 8],
            original_message_id: message_id,
            recipient_id: recipient,
            hop_count: 1,
        }
    }

    #[test]
    fn private_message_delivers_on_single_ack() {
        let mut tracker = DeliveryTracker::default();
        let id = [1u8; 8];
        tracker.track(id, false, false, 1);

        assert!(tracker.apply_ack(&ack(1, id, peer(2))));
        assert_eq!(tracker.state_of(id), Some(DeliveryState::Delivered));
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let mut tracker = DeliveryTracker::default();
        let id = [2u8; 8];
        tracker.track(id, false, false, 1);

        assert!(tracker.apply_ack(&ack(5, id, peer(2))));
        assert!(!tracker.apply_ack(&ack(5, id, peer(2))));
    }

    #[test]
    fn channel_message_partially_delivered_below_half() {
        let mut tracker = DeliveryTracker::default();
        let id = [3u8; 8];
        tracker.track(id, true, false, 5);

        tracker.apply_ack(&ack(1, id, peer(1)));
        assert_eq!(tracker.state_of(id), Some(DeliveryState::PartiallyDelivered));
    }

    #[test]
    fn channel_message_delivered_at_majority() {
        let mut tracker = DeliveryTracker::default();
        let id = [4u8; 8];
        tracker.track(id, true, false, 4);

        tracker.apply_ack(&ack(1, id, peer(1)));
        tracker.apply_ack(&ack(2, id, peer(2)));
        assert_eq!(tracker.state_of(id), Some(DeliveryState::Delivered));
    }

    #[test]
    fn read_receipt_marks_read() {
        let mut tracker = DeliveryTracker::default();
        let id = [6u8; 8];
        tracker.track(id, false, false, 1);

        assert!(tracker.apply_read_receipt(id, peer(9)));
        assert_eq!(tracker.state_of(id), Some(DeliveryState::Read));
    }

    #[test]
    fn non_favorite_timeout_fails_without_retry() {
        let mut tracker = DeliveryTracker::default();
        let id = [7u8; 8];
        tracker.track(id, false, false, 1);
        if let Some(record) = tracker.records.get_mut(&id) {
            record.sent_at = Instant::now() - PRIVATE_TIMEOUT - Duration::from_secs(1);
        }

        let retries = tracker.sweep_timeouts();
        assert!(retries.is_empty());
        assert_eq!(tracker.state_of(id), Some(DeliveryState::Failed));
    }

    #[test]
    fn favorite_timeout_yields_retry_candidate() {
        let mut tracker = DeliveryTracker::default();
        let id = [8u8; 8];
        tracker.track(id, false, true, 1);
        if let Some(record) = tracker.records.get_mut(&id) {
            record.sent_at = Instant::now() - FAVORITE_TIMEOUT - Duration::from_secs(1);
        }

        let retries = tracker.sweep_timeouts();
        assert_eq!(retries, vec![id]);
        assert_ne!(tracker.state_of(id), Some(DeliveryState::Failed));
    }
}
