//! Session registry.
//!
//! Maps every joined connection to its write half. Sessions insert and
//! remove entries; channel subscribers read a snapshot of the entries for
//! their channel and release the map before writing to any peer.

use dashmap::DashMap;
use parley_transport::SharedSink;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Atomic counter keeping keys unique even within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one joined connection.
///
/// The same user may hold several connections to the same channel; the
/// creation timestamp tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    /// Channel the connection joined.
    pub channel: String,
    /// Username of the connection.
    pub user: String,
    /// Connection creation time in nanoseconds since the Unix epoch.
    pub connected_at: u128,
}

impl PeerKey {
    /// Create a key for a connection created now.
    #[must_use]
    pub fn new(channel: impl Into<String>, user: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);

        Self {
            channel: channel.into(),
            user: user.into(),
            connected_at: timestamp.wrapping_add(u128::from(counter)),
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.user, self.connected_at)
    }
}

/// Registry of joined connections.
#[derive(Default)]
pub struct SessionRegistry {
    peers: DashMap<PeerKey, SharedSink>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a joined connection.
    pub fn register(&self, key: PeerKey, sink: SharedSink) {
        debug!(peer = %key, "Peer registered");
        self.peers.insert(key, sink);
    }

    /// Remove a connection, returning its sink if it was registered.
    pub fn deregister(&self, key: &PeerKey) -> Option<SharedSink> {
        let removed = self.peers.remove(key).map(|(_, sink)| sink);
        if removed.is_some() {
            debug!(peer = %key, "Peer deregistered");
        }
        removed
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn contains(&self, key: &PeerKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Snapshot every connection registered under `channel`.
    ///
    /// No lock is held once this returns.
    #[must_use]
    pub fn peers_in(&self, channel: &str) -> Vec<(PeerKey, SharedSink)> {
        self.peers
            .iter()
            .filter(|entry| entry.key().channel == channel)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Remove and return every registered connection.
    pub fn drain(&self) -> Vec<(PeerKey, SharedSink)> {
        let keys: Vec<PeerKey> = self.peers.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.peers.remove(&key))
            .collect()
    }

    /// Get the number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_transport::memory;
    use std::sync::Arc;

    fn sink() -> SharedSink {
        let (sink, _stream, _client) = memory::pair();
        sink
    }

    #[test]
    fn test_peer_keys_unique() {
        let k1 = PeerKey::new("lobby", "alice");
        let k2 = PeerKey::new("lobby", "alice");
        assert_ne!(k1, k2);
        assert!(k1.to_string().starts_with("lobby:alice:"));
    }

    #[test]
    fn test_register_deregister() {
        let registry = SessionRegistry::new();
        let alice = PeerKey::new("lobby", "alice");
        let bob = PeerKey::new("lobby", "bob");

        registry.register(alice.clone(), sink());
        registry.register(bob.clone(), sink());
        assert_eq!(registry.len(), 2);

        assert!(registry.deregister(&alice).is_some());
        assert!(registry.deregister(&alice).is_none());
        assert!(!registry.contains(&alice));
        assert!(registry.contains(&bob));
    }

    #[test]
    fn test_peers_in_channel() {
        let registry = SessionRegistry::new();
        let shared = sink();
        registry.register(PeerKey::new("lobby", "alice"), Arc::clone(&shared));
        registry.register(PeerKey::new("lobby", "alice"), shared);
        registry.register(PeerKey::new("random", "bob"), sink());

        let lobby = registry.peers_in("lobby");
        assert_eq!(lobby.len(), 2);
        assert!(lobby.iter().all(|(key, _)| key.user == "alice"));
        assert!(registry.peers_in("missing").is_empty());
    }

    #[test]
    fn test_drain() {
        let registry = SessionRegistry::new();
        registry.register(PeerKey::new("lobby", "alice"), sink());
        registry.register(PeerKey::new("random", "bob"), sink());

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }
}
