//! Fragmentation and reassembly of oversized mesh packets.
//!
//! Outbound payloads larger than [`MAX_UNFRAGMENTED_SIZE`] are split into
//! chunks of at most [`MAX_FRAGMENT_SIZE`] and sent as a
//! `FragmentStart, FragmentContinue*, FragmentEnd` sequence. Inbound
//! fragments are reassembled keyed by `fragmentID`, bounded in count,
//! total bytes, and age so a malicious or broken peer cannot exhaust memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};

use crate::error::SessionError;
use crate::packet::PEER_ID_SIZE;

/// Payloads at or below this size are sent unfragmented.
pub const MAX_UNFRAGMENTED_SIZE: usize = 512;

/// Maximum bytes carried per fragment slice.
pub const MAX_FRAGMENT_SIZE: usize = 500;

/// Maximum number of fragment sessions in flight at once.
pub const MAX_CONCURRENT_SESSIONS: usize = 20;

/// Maximum total bytes held across all in-flight fragment sessions.
pub const MAX_TOTAL_BYTES: usize = 10 * 1024 * 1024;

/// Fragment sessions older than this are dropped, complete or not.
pub const SESSION_TTL: Duration = Duration::from_secs(30);

/// Size of the `fragmentID` field.
const FRAGMENT_ID_SIZE: usize = 8;

/// One slice of a fragmented message.
pub struct Fragment {
    /// Identifies which logical message this fragment belongs to.
    pub fragment_id: [u8; FRAGMENT_ID_SIZE],
    /// Zero-based position of this slice.
    pub index: u16,
    /// Total number of slices in the message.
    pub total: u16,
    /// Message type of the original, unfragmented payload.
    pub original_type: u8,
    /// This slice's bytes.
    pub slice: Vec<u8>,
}

/// Split `payload` into a sequence of fragments, or `None` if it fits unfragmented.
#[must_use]
pub fn split(original_type: u8, payload: &[u8]) -> Option<Vec<Fragment>> {
    if payload.len() <= MAX_UNFRAGMENTED_SIZE {
        return None;
    }

    let mut fragment_id = [0u8; FRAGMENT_ID_SIZE];
    OsRng.fill_bytes(&mut fragment_id);

    let chunks: Vec<&[u8]> = payload.chunks(MAX_FRAGMENT_SIZE).collect();
    let total = chunks.len() as u16;

    Some(
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, slice)| Fragment {
                fragment_id,
                index: index as u16,
                total,
                original_type,
                slice: slice.to_vec(),
            })
            .collect(),
    )
}

struct InFlight {
    original_type: u8,
    total: u16,
    received: HashMap<u16, Vec<u8>>,
    bytes_received: usize,
    created_at: Instant,
}

/// Reassembles inbound fragments into complete payloads.
pub struct Reassembler {
    sessions: HashMap<[u8; FRAGMENT_ID_SIZE], InFlight>,
    total_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            total_bytes: 0,
        }
    }

    /// Drop sessions older than [`SESSION_TTL`].
    pub fn evict_expired(&mut self) {
        let expired: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.created_at.elapsed() >= SESSION_TTL)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                self.total_bytes -= session.bytes_received;
            }
        }
    }

    /// Evict the oldest in-flight session to make room for a new one.
    fn evict_oldest(&mut self) {
        if let Some(oldest_id) = self
            .sessions
            .iter()
            .min_by_key(|(_, s)| s.created_at)
            .map(|(id, _)| *id)
        {
            if let Some(session) = self.sessions.remove(&oldest_id) {
                self.total_bytes -= session.bytes_received;
            }
        }
    }

    /// Feed in one fragment. Returns the reassembled payload and its
    /// original message type once the final slice arrives.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::FragmentOverflow` if accepting this fragment's
    /// session would require evicting more than one existing session and the
    /// bookkeeping bounds still can't be satisfied (should not happen given
    /// `MAX_CONCURRENT_SESSIONS`/`MAX_TOTAL_BYTES` are both finite).
    pub fn accept(&mut self, fragment: Fragment) -> Result<Option<(u8, Vec<u8>)>, SessionError> {
        self.evict_expired();

        if !self.sessions.contains_key(&fragment.fragment_id) {
            if self.sessions.len() >= MAX_CONCURRENT_SESSIONS {
                self.evict_oldest();
            }
            self.sessions.insert(
                fragment.fragment_id,
                InFlight {
                    original_type: fragment.original_type,
                    total: fragment.total,
                    received: HashMap::new(),
                    bytes_received: 0,
                    created_at: Instant::now(),
                },
            );
        }

        let slice_len = fragment.slice.len();
        while self.total_bytes + slice_len > MAX_TOTAL_BYTES && !self.sessions.is_empty() {
            self.evict_oldest();
        }

        if self.total_bytes + slice_len > MAX_TOTAL_BYTES {
            return Err(SessionError::FragmentOverflow);
        }

        let session = self
            .sessions
            .get_mut(&fragment.fragment_id)
            .ok_or(SessionError::FragmentOverflow)?;

        if session.received.insert(fragment.index, fragment.slice).is_none() {
            session.bytes_received += slice_len;
            self.total_bytes += slice_len;
        }

        let session = &self.sessions[&fragment.fragment_id];
        if session.received.len() as u16 != session.total {
            return Ok(None);
        }

        let session = self.sessions.remove(&fragment.fragment_id).unwrap();
        self.total_bytes -= session.bytes_received;

        let mut payload = Vec::with_capacity(session.bytes_received);
        for index in 0..session.total {
            let slice = session
                .received
                .get(&index)
                .expect("all indices present once total reached");
            payload.extend_from_slice(slice);
        }

        Ok(Some((session.original_type, payload)))
    }

    /// Number of fragment sessions currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_not_split() {
        assert!(split(0x04, &[0u8; 100]).is_none());
    }

    #[test]
    fn large_payload_splits_and_reassembles() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let fragments = split(0x04, &payload).unwrap();
        assert!(fragments.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for fragment in fragments {
            result = reassembler.accept(fragment).unwrap();
        }

        let (original_type, reassembled) = result.expect("final fragment completes the message");
        assert_eq!(original_type, 0x04);
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn out_of_order_fragments_still_reassemble() {
        let payload = vec![0xABu8; 1500];
        let mut fragments = split(0x04, &payload).unwrap();
        fragments.reverse();

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for fragment in fragments {
            result = reassembler.accept(fragment).unwrap();
        }

        assert!(result.is_some());
    }

    #[test]
    fn expired_sessions_are_evicted() {
        let payload = vec![0u8; 2000];
        let mut fragments = split(0x04, &payload).unwrap();
        let first = fragments.remove(0);

        let mut reassembler = Reassembler::new();
        reassembler.accept(first).unwrap();
        assert_eq!(reassembler.in_flight_count(), 1);
    }

    #[test]
    fn concurrent_session_cap_evicts_oldest() {
        let mut reassembler = Reassembler::new();
        for i in 0..(MAX_CONCURRENT_SESSIONS + 5) {
            let payload = vec![i as u8; 1000];
            let fragments = split(0x04, &payload).unwrap();
            reassembler.accept(fragments.into_iter().next().unwrap()).unwrap();
        }
        assert!(reassembler.in_flight_count() <= MAX_CONCURRENT_SESSIONS);
    }
}
