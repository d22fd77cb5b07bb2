//! Retry queue for user-originated sends that reached zero recipients.
//!
//! When a send leaves no peer connected to relay it, the packet is held here
//! and retried on a fixed interval, only while at least one peer is
//! connected, up to a bounded attempt count.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum number of packets held for retry at once.
pub const MAX_ENTRIES: usize = 50;

/// How often queued entries are retried.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum retry attempts before an entry is dropped.
pub const MAX_ATTEMPTS: u8 = 3;

/// An outbound packet held for retry, preserving its original message id and timestamp.
pub struct RetryEntry {
    /// Original message id, unchanged across retries.
    pub message_id: [u8; 8],
    /// Original wire timestamp, unchanged across retries.
    pub original_timestamp: u64,
    /// The encoded packet bytes to resend.
    pub encoded: Vec<u8>,
    attempts: u8,
    queued_at: Instant,
    last_attempt: Option<Instant>,
}

impl RetryEntry {
    fn due(&self) -> bool {
        self.last_attempt
            .is_none_or(|at| at.elapsed() >= RETRY_INTERVAL)
    }
}

/// Bounded FIFO of packets awaiting retry.
#[derive(Default)]
pub struct RetryQueue {
    entries: VecDeque<RetryEntry>,
}

impl RetryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a packet for retry, dropping the oldest entry if at capacity.
    pub fn push(&mut self, message_id: [u8; 8], original_timestamp: u64, encoded: Vec<u8>) {
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(RetryEntry {
            message_id,
            original_timestamp,
            encoded,
            attempts: 0,
            queued_at: Instant::now(),
            last_attempt: None,
        });
    }

    /// Drain all entries due for a retry attempt right now, given that at
    /// least one peer is connected. Entries that have exhausted their
    /// attempt budget are dropped rather than returned.
    ///
    /// Returns the encoded packets to re-send, in FIFO order.
    pub fn take_due(&mut self, any_peer_connected: bool) -> Vec<Vec<u8>> {
        if !any_peer_connected {
            return Vec::new();
        }

        let mut due = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.attempts >= MAX_ATTEMPTS {
                return false;
            }
            if entry.due() {
                entry.attempts += 1;
                entry.last_attempt = Some(Instant::now());
                due.push(entry.encoded.clone());
            }
            true
        });
        self.entries.retain(|entry| entry.attempts < MAX_ATTEMPTS);
        due
    }

    /// Remove an entry by message id, e.g. once it's confirmed delivered
    /// through some other path.
    pub fn remove(&mut self, message_id: [u8; 8]) {
        self.entries.retain(|entry| entry.message_id != message_id);
    }

    /// Age of the oldest entry still queued, for diagnostics.
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        self.entries.front().map(|e| e.queued_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_not_retried_without_connected_peer() {
        let mut queue = RetryQueue::new();
        queue.push([1; 8], 1000, vec![0xAA]);
        assert!(queue.take_due(false).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn fresh_entry_is_due_immediately_when_peer_connected() {
        let mut queue = RetryQueue::new();
        queue.push([1; 8], 1000, vec![0xAA]);
        let due = queue.take_due(true);
        assert_eq!(due, vec![vec![0xAA]]);
    }

    #[test]
    fn entry_not_due_again_before_interval_elapses() {
        let mut queue = RetryQueue::new();
        queue.push([1; 8], 1000, vec![0xAA]);
        queue.take_due(true);
        assert!(queue.take_due(true).is_empty());
    }

    #[test]
    fn entry_dropped_after_max_attempts() {
        let mut queue = RetryQueue::new();
        queue.push([1; 8], 1000, vec![0xAA]);
        for i in 0..MAX_ATTEMPTS {
            if let Some(entry) = queue.entries.front_mut() {
                entry.last_attempt = Some(Instant::now() - RETRY_INTERVAL - Duration::from_millis(1));
                entry.attempts = i;
            }
            queue.take_due(true);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_bounded_at_max_entries() {
        let mut queue = RetryQueue::new();
        for i in 0..(MAX_ENTRIES + 5) {
            queue.push([i as u8; 8], i as u64, vec![i as u8]);
        }
        assert_eq!(queue.len(), MAX_ENTRIES);
    }

    #[test]
    fn remove_drops_matching_entry() {
        let mut queue = RetryQueue::new();
        queue.push([1; 8], 1000, vec![0xAA]);
        queue.push([2; 8], 2000, vec![0xBB]);
        queue.remove([1; 8]);
        assert_eq!(queue.len(), 1);
    }
}
