//! Presence store adapter.
//!
//! The presence store is an external key/value service with set membership
//! and publish/subscribe primitives. Backends implement the handful of raw
//! primitives; the presence operations the relay needs are provided on top
//! of them using the layout in [`crate::keys`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreError;
use crate::keys::{CHANNELS_KEY, USERS_KEY};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// A long-lived channel subscription yielding raw published payloads.
///
/// The stream ends when the subscription or the store connection closes.
/// Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, String>;

/// A presence store backend.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Test whether `member` belongs to the set at `key`.
    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Add `member` to the set at `key`. Idempotent.
    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove `member` from the set at `key`. Idempotent.
    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Publish a payload on a channel topic.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Open a subscription on a channel topic.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Close the store connection.
    async fn close(&self) -> Result<(), StoreError>;

    /// Check whether a channel is active.
    async fn channel_exists(&self, channel: &str) -> Result<bool, StoreError> {
        self.is_member(CHANNELS_KEY, channel).await
    }

    /// Check whether a user is active.
    async fn user_exists(&self, user: &str) -> Result<bool, StoreError> {
        self.is_member(USERS_KEY, user).await
    }

    /// Mark a channel as active.
    async fn create_channel(&self, channel: &str) -> Result<(), StoreError> {
        self.add_member(CHANNELS_KEY, channel).await
    }

    /// Mark a user as active.
    async fn create_user(&self, user: &str) -> Result<(), StoreError> {
        self.add_member(USERS_KEY, user).await
    }

    /// Check whether a user is a member of a channel.
    async fn user_in_channel(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        self.is_member(channel, user).await
    }

    /// Add a user to a channel's member set.
    async fn join_channel(&self, channel: &str, user: &str) -> Result<(), StoreError> {
        self.add_member(channel, user).await
    }

    /// Remove a user from the active-users set.
    ///
    /// Channel member sets are left untouched.
    async fn remove_user(&self, user: &str) -> Result<(), StoreError> {
        self.remove_member(USERS_KEY, user).await
    }

    /// Remove a channel from the active-channels set.
    async fn remove_channel(&self, channel: &str) -> Result<(), StoreError> {
        self.remove_member(CHANNELS_KEY, channel).await
    }
}
