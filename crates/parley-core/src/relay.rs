//! The relay context.
//!
//! A [`Relay`] owns everything sessions and subscribers share: the presence
//! store, the session registry, the subscriber registry and the counters.
//! It is created once at startup, handed to every session as an `Arc`, and
//! torn down with [`Relay::shutdown`].

use parley_protocol::{codec, Envelope};
use parley_transport::PeerSink;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::registry::SessionRegistry;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::store::PresenceStore;
use crate::subscriber::{ChannelSubscriber, SubscriberRegistry};

/// What to do when a connecting user's name is already active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsernamePolicy {
    /// Admit the connection; several connections may share a username.
    #[default]
    Allow,
    /// Tell the peer the name is taken and close the connection.
    Reject,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Handling of duplicate usernames.
    pub username_policy: UsernamePolicy,
    /// Upper bound on a single delivery write.
    pub send_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            username_policy: UsernamePolicy::Allow,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared state for every session and channel subscriber of a process.
pub struct Relay {
    store: Arc<dyn PresenceStore>,
    sessions: Arc<SessionRegistry>,
    subscribers: SubscriberRegistry,
    stats: Arc<RelayStats>,
    config: RelayConfig,
    shutting_down: AtomicBool,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self::with_config(store, RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn PresenceStore>, config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            store,
            sessions: Arc::new(SessionRegistry::new()),
            subscribers: SubscriberRegistry::new(),
            stats: Arc::new(RelayStats::new()),
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Get the presence store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Get the session registry.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Get the subscriber registry.
    #[must_use]
    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    /// Get the relay counters.
    #[must_use]
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Check whether [`Relay::shutdown`] has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Make sure `channel` has a running subscriber.
    ///
    /// Returns `true` if this call started it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the subscription.
    pub async fn ensure_subscriber(&self, channel: &str) -> Result<bool, StoreError> {
        let subscriber = ChannelSubscriber::new(
            channel,
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
            self.config.send_timeout,
        );
        let started = self.subscribers.ensure(subscriber).await?;
        if started {
            debug!(channel = %channel, "Started channel subscriber");
        }
        Ok(started)
    }

    /// Publish an envelope to its channel.
    ///
    /// Fire and forget: a failure is logged and counted, never retried, and
    /// never reported to the author. Returns whether the store accepted it.
    pub async fn publish(&self, envelope: &Envelope) -> bool {
        let payload = match codec::encode(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %envelope.channel, error = %e, "Could not encode envelope");
                self.stats.record_publish_failure();
                return false;
            }
        };

        match self.store.publish(&envelope.channel, &payload).await {
            Ok(()) => {
                trace!(channel = %envelope.channel, kind = %envelope.kind, "Published envelope");
                self.stats.record_published();
                true
            }
            Err(e) => {
                warn!(channel = %envelope.channel, error = %e, "Could not publish to channel");
                self.stats.record_publish_failure();
                false
            }
        }
    }

    /// Get a status report.
    pub async fn status(&self) -> RelayStatus {
        RelayStatus {
            peers: self.sessions.len(),
            channels: self.subscribers.len().await,
            counters: self.stats.snapshot(),
        }
    }

    /// Tear the relay down.
    ///
    /// Removes every registered user from the store and closes its
    /// connection, stops every channel subscriber, then closes the store.
    /// Entries already gone are skipped, so calling this twice is harmless.
    /// Sessions still joining see the flag set here and turn themselves
    /// away; the subscriber registry refuses new subscriptions afterwards.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let peers = self.sessions.drain();
        let peer_count = peers.len();
        for (key, sink) in peers {
            if let Err(e) = self.store.remove_user(&key.user).await {
                warn!(peer = %key, error = %e, "Failed to remove user");
            }
            if let Err(e) = sink.close().await {
                debug!(peer = %key, error = %e, "Failed to close connection");
            }
        }
        info!(peers = peer_count, "Cleaned up users and sessions");

        let subscriber_count = self.subscribers.shutdown().await;
        info!(subscribers = subscriber_count, "Closed channel subscriptions");

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close presence store");
        }
    }
}

/// Relay status report.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    /// Registered connections.
    pub peers: usize,
    /// Channels with a subscriber.
    pub channels: usize,
    /// Relay counters.
    pub counters: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerKey;
    use crate::store::MemoryStore;
    use parley_transport::memory;

    #[tokio::test]
    async fn test_publish_counts_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let relay = Relay::new(store.clone());

        assert!(relay.publish(&Envelope::joined("lobby", "alice")).await);
        store.set_available(false);
        assert!(!relay.publish(&Envelope::left("lobby", "alice")).await);

        let counters = relay.stats().snapshot();
        assert_eq!(counters.published, 1);
        assert_eq!(counters.publish_failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_starts_one_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let relay = Arc::new(Relay::new(store.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let relay = Arc::clone(&relay);
                tokio::spawn(async move { relay.ensure_subscriber("lobby").await.unwrap() })
            })
            .collect();

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap() {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert_eq!(store.subscriber_count("lobby"), 1);
        assert_eq!(relay.status().await.channels, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let relay = Relay::new(store.clone());

        store.create_user("alice").await.unwrap();
        let (sink, _stream, client) = memory::pair();
        relay.sessions().register(PeerKey::new("lobby", "alice"), sink);
        relay.ensure_subscriber("lobby").await.unwrap();

        relay.shutdown().await;
        assert!(relay.is_shutting_down());
        assert!(relay.sessions().is_empty());
        assert!(relay.subscribers().is_empty().await);
        assert!(!client.is_open());
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));

        relay.shutdown().await;
    }

    #[test]
    fn test_username_policy_serde() {
        let policy: UsernamePolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(policy, UsernamePolicy::Reject);
        assert_eq!(UsernamePolicy::default(), UsernamePolicy::Allow);
    }
}
