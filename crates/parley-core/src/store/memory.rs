//! In-process presence store.
//!
//! Sets live in a [`DashMap`]; each channel topic is a tokio broadcast
//! channel. Useful for single-node deployments and tests, which can also
//! simulate an outage with [`MemoryStore::set_available`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{PresenceStore, Subscription};
use crate::error::StoreError;

/// Default broadcast capacity per topic.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// An in-process presence store.
#[derive(Debug)]
pub struct MemoryStore {
    sets: DashMap<String, HashSet<String>>,
    topics: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
    closed: AtomicBool,
    capacity: usize,
}

impl MemoryStore {
    /// Create a new store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a new store with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sets: DashMap::new(),
            topics: DashMap::new(),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the members of the set at `key`.
    #[must_use]
    pub fn members(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the number of live subscriptions on a topic.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.topics
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member)))
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(tx) = self.topics.get(channel) {
            // No receivers is not an error, same as a pub/sub server.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check()?;
        let rx = self
            .topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!(channel = %channel, "Memory subscription opened");

        let channel = channel.to_string();
        let messages = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(messages.boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the senders ends every open subscription.
            self.topics.clear();
            debug!("Memory store closed");
        }
        Ok(())
    }
}
