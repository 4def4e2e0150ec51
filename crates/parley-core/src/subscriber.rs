//! Channel subscribers.
//!
//! Each active channel has exactly one subscriber task per process. It
//! consumes the channel's pub/sub stream and hands every payload, unmodified,
//! to the registered connections that should see it.

use futures_util::StreamExt;
use parley_protocol::codec;
use parley_transport::PeerSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::registry::SessionRegistry;
use crate::stats::RelayStats;
use crate::store::{PresenceStore, Subscription};

/// The delivery loop for one channel.
#[derive(Clone)]
pub struct ChannelSubscriber {
    channel: String,
    store: Arc<dyn PresenceStore>,
    sessions: Arc<SessionRegistry>,
    stats: Arc<RelayStats>,
    send_timeout: Duration,
}

impl ChannelSubscriber {
    /// Create a subscriber for `channel`.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        sessions: Arc<SessionRegistry>,
        stats: Arc<RelayStats>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            channel: channel.into(),
            store,
            sessions,
            stats,
            send_timeout,
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Consume the subscription until it closes.
    pub async fn run(self, mut subscription: Subscription) {
        info!(channel = %self.channel, "Subscriber started");

        while let Some(payload) = subscription.next().await {
            self.dispatch(&payload).await;
        }

        info!(channel = %self.channel, "Subscription closed");
    }

    /// Deliver one published payload.
    ///
    /// A peer receives it when it is registered under this channel, its
    /// username differs from the envelope's author, and the store currently
    /// lists it as a channel member. Returns the number of successful writes.
    pub async fn dispatch(&self, payload: &str) -> usize {
        let envelope = codec::decode_lenient(payload.as_bytes());
        trace!(channel = %self.channel, from = %envelope.from, kind = %envelope.kind, "Received envelope");

        if envelope.channel != self.channel {
            warn!(
                channel = %self.channel,
                envelope_channel = %envelope.channel,
                "Envelope names a different channel"
            );
        }

        // Membership is checked once per user per envelope.
        let mut membership: HashMap<String, bool> = HashMap::new();
        let mut delivered = 0;

        for (key, sink) in self.sessions.peers_in(&self.channel) {
            if key.user == envelope.from {
                continue;
            }

            let is_member = match membership.get(&key.user) {
                Some(is_member) => *is_member,
                None => {
                    let is_member = match self.store.user_in_channel(&self.channel, &key.user).await {
                        Ok(is_member) => is_member,
                        Err(e) => {
                            warn!(channel = %self.channel, user = %key.user, error = %e, "Membership check failed");
                            false
                        }
                    };
                    membership.insert(key.user.clone(), is_member);
                    is_member
                }
            };

            if !is_member {
                trace!(peer = %key, "Skipping peer outside channel");
                continue;
            }

            match tokio::time::timeout(self.send_timeout, sink.send_text(payload)).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(peer = %key, error = %e, "Failed to write message");
                    self.stats.record_delivery_failure();
                }
                Err(_) => {
                    warn!(peer = %key, "Write timed out");
                    self.stats.record_delivery_failure();
                }
            }
        }

        self.stats.record_received(delivered as u64);
        debug!(channel = %self.channel, recipients = delivered, "Delivered envelope");
        delivered
    }
}

/// The process-wide set of running channel subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
    // Only read or written with `handles` locked.
    closed: AtomicBool,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `subscriber` unless its channel already has a running one.
    ///
    /// The registry stays locked while the subscription is opened, so
    /// concurrent callers for the same channel start exactly one task. A
    /// subscriber whose stream ended is replaced. Returns `true` if a task
    /// was spawned.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the subscription, or
    /// [`StoreError::Closed`] once [`SubscriberRegistry::shutdown`] ran.
    pub async fn ensure(&self, subscriber: ChannelSubscriber) -> Result<bool, StoreError> {
        let mut handles = self.handles.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            debug!(channel = %subscriber.channel(), "Registry shut down, not subscribing");
            return Err(StoreError::Closed);
        }

        if let Some(handle) = handles.get(subscriber.channel()) {
            if !handle.is_finished() {
                trace!(channel = %subscriber.channel(), "Already subscribed");
                return Ok(false);
            }
            debug!(channel = %subscriber.channel(), "Replacing finished subscriber");
        }

        let subscription = subscriber.store.subscribe(subscriber.channel()).await?;
        let channel = subscriber.channel().to_string();
        let handle = tokio::spawn(subscriber.run(subscription));
        handles.insert(channel, handle);

        Ok(true)
    }

    /// Check whether a channel has a running subscriber.
    pub async fn is_running(&self, channel: &str) -> bool {
        self.handles
            .lock()
            .await
            .get(channel)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Get the number of tracked subscribers.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Check if no subscriber is tracked.
    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    /// Stop every subscriber, dropping (and so unsubscribing) its stream.
    ///
    /// Later calls to [`SubscriberRegistry::ensure`] fail. Returns the
    /// number of subscribers stopped. Safe to call repeatedly.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut handles = self.handles.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            handles.drain().collect()
        };
        let count = handles.len();

        for (channel, handle) in handles {
            handle.abort();
            debug!(channel = %channel, "Subscriber stopped");
        }

        count
    }
}
