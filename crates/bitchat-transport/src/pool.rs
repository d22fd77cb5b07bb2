//! Connection bookkeeping shared by the central and peripheral roles.
//!
//! BLE has no notion of a stable peer-id at the link layer - a central only
//! knows a platform-assigned device identifier (`PeripheralId` on `btleplug`,
//! a `bluer` device path on the peripheral side) until the first packet
//! reveals the sender's `PeerId`. The pool tracks that binding plus
//! connection state and retry bookkeeping for each known device.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bitchat_core::PeerId;

/// Connection lifecycle of one discovered BLE device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Discovered but no GATT link established.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// GATT link up, service/characteristic discovery done.
    Connected,
    /// The last connection attempt failed.
    Failed,
}

/// Maximum number of consecutive reconnect attempts before a peer is left
/// disconnected until it re-advertises.
const MAX_RETRIES: u32 = 3;

/// Base delay for the exponential backoff between reconnect attempts.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Bookkeeping for one BLE device, keyed by its platform-level identity
/// until (and after) its `PeerId` is learned from the wire.
#[derive(Debug, Clone)]
pub struct PooledConnection<D> {
    /// Opaque platform device handle (a `btleplug::Peripheral` or similar).
    pub device: D,
    /// BitChat peer-id, once it has been observed on a received packet.
    pub peer_id: Option<PeerId>,
    /// Current connection state.
    pub state: ConnectionState,
    /// Timestamp of the most recent connection attempt.
    pub last_attempt: Option<Instant>,
    /// Consecutive failed attempts since the last success.
    pub retry_count: u32,
}

impl<D> PooledConnection<D> {
    /// Wrap a freshly discovered device, not yet connected.
    pub fn new(device: D) -> Self {
        Self {
            device,
            peer_id: None,
            state: ConnectionState::Disconnected,
            last_attempt: None,
            retry_count: 0,
        }
    }

    /// Whether the GATT link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether another reconnect attempt is due: under the retry ceiling and
    /// past this attempt's exponential backoff delay.
    #[must_use]
    pub fn can_retry(&self, now: Instant) -> bool {
        if self.retry_count >= MAX_RETRIES {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => now.duration_since(last) >= backoff_delay(self.retry_count),
        }
    }

    /// Record the start of a connection attempt.
    pub fn mark_attempting(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.last_attempt = Some(now);
        self.retry_count += 1;
    }

    /// Record a successful connection, resetting the retry counter.
    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.retry_count = 0;
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
    }

    /// Record a link drop with no associated error, resetting the retry
    /// counter since this isn't a failed attempt.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.retry_count = 0;
    }

    /// Bind the peer-id learned from the first packet this device sent.
    pub fn bind_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = Some(peer_id);
    }
}

/// `1s * 2^attempts`, capped implicitly by `MAX_RETRIES`.
fn backoff_delay(attempts: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempts)
}

/// A table of pooled connections plus the `PeerId -> device key` reverse index
/// needed to route an outbound send to the right device.
pub struct ConnectionPool<K, D> {
    connections: HashMap<K, PooledConnection<D>>,
    by_peer_id: HashMap<PeerId, K>,
}

impl<K, D> Default for ConnectionPool<K, D>
where
    K: std::hash::Hash + Eq,
{
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            by_peer_id: HashMap::new(),
        }
    }
}

impl<K, D> ConnectionPool<K, D>
where
    K: std::hash::Hash + Eq + Clone,
{
    /// Insert a newly discovered device, if not already tracked.
    pub fn insert_if_absent(&mut self, key: K, device: D) {
        self.connections
            .entry(key)
            .or_insert_with(|| PooledConnection::new(device));
    }

    /// Look up a connection by its platform key.
    pub fn get(&self, key: &K) -> Option<&PooledConnection<D>> {
        self.connections.get(key)
    }

    /// Mutably look up a connection by its platform key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut PooledConnection<D>> {
        self.connections.get_mut(key)
    }

    /// Bind a peer-id to a device key, updating the reverse index.
    pub fn bind_peer_id(&mut self, key: &K, peer_id: PeerId) {
        if let Some(conn) = self.connections.get_mut(key) {
            conn.bind_peer_id(peer_id);
            self.by_peer_id.insert(peer_id, key.clone());
        }
    }

    /// Find the device key for a bound peer-id.
    #[must_use]
    pub fn key_for_peer(&self, peer_id: PeerId) -> Option<&K> {
        self.by_peer_id.get(&peer_id)
    }

    /// Device keys of every currently connected peer.
    pub fn connected_keys(&self) -> impl Iterator<Item = &K> {
        self.connections
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(k, _)| k)
    }

    /// Device keys eligible for a reconnect attempt right now.
    pub fn retryable_keys(&self, now: Instant) -> Vec<K> {
        self.connections
            .iter()
            .filter(|(_, c)| {
                matches!(c.state, ConnectionState::Disconnected | ConnectionState::Failed)
                    && c.can_retry(now)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop a device and its reverse-index entry entirely.
    pub fn remove(&mut self, key: &K) {
        if let Some(conn) = self.connections.remove(key) {
            if let Some(peer_id) = conn.peer_id {
                self.by_peer_id.remove(&peer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    #[test]
    fn fresh_connection_can_retry_immediately() {
        let conn = PooledConnection::new(());
        assert!(conn.can_retry(Instant::now()));
    }

    #[test]
    fn retry_ceiling_blocks_further_attempts() {
        let mut conn = PooledConnection::new(());
        let now = Instant::now();
        for _ in 0..MAX_RETRIES {
            conn.mark_attempting(now - Duration::from_secs(3600));
        }
        assert!(!conn.can_retry(Instant::now()));
    }

    #[test]
    fn backoff_delay_doubles_each_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn pool_routes_by_bound_peer_id() {
        let mut pool: ConnectionPool<&'static str, ()> = ConnectionPool::default();
        pool.insert_if_absent("dev-a", ());
        pool.bind_peer_id(&"dev-a", pid(1));

        assert_eq!(pool.key_for_peer(pid(1)), Some(&"dev-a"));
        assert_eq!(pool.key_for_peer(pid(2)), None);
    }

    #[test]
    fn remove_clears_reverse_index() {
        let mut pool: ConnectionPool<&'static str, ()> = ConnectionPool::default();
        pool.insert_if_absent("dev-a", ());
        pool.bind_peer_id(&"dev-a", pid(1));
        pool.remove(&"dev-a");

        assert_eq!(pool.key_for_peer(pid(1)), None);
        assert!(pool.get(&"dev-a").is_none());
    }
}
