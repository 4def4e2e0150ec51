//! Relay counters.
//!
//! Publishing and delivery are best effort; these counters are where the
//! dropped outcomes become visible.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by sessions and channel subscribers.
#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    envelopes_received: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

impl RelayStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one envelope fully processed by a channel subscriber.
    pub fn record_received(&self, delivered: u64) {
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.envelopes_received.fetch_add(1, Ordering::Release);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Acquire),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// A copy of the relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Envelopes accepted by the presence store.
    pub published: u64,
    /// Envelopes dropped because the store rejected the publish.
    pub publish_failures: u64,
    /// Envelopes processed by channel subscribers.
    pub envelopes_received: u64,
    /// Successful writes to peers.
    pub delivered: u64,
    /// Failed or timed out writes to peers.
    pub delivery_failures: u64,
}
