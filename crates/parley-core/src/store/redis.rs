//! Redis presence store.
//!
//! Set operations and `PUBLISH` go over one multiplexed connection, which
//! [`RedisStore::close`] drops. Every channel subscription opens its own
//! pub/sub connection, released when the subscription stream is dropped.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{PresenceStore, Subscription};
use crate::error::StoreError;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// A Redis-backed presence store.
pub struct RedisStore {
    client: redis::Client,
    // `None` once closed.
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!("Connecting to Redis at {}", url);
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn.lock().await.clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let found: bool = conn.sismember(key, member).await?;
        Ok(found)
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        if self.conn.lock().await.is_none() {
            return Err(StoreError::Closed);
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Redis subscription opened");

        let channel = channel.to_string();
        let messages = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-text payload");
                        None
                    }
                }
            }
        });

        Ok(messages.boxed())
    }

    /// Drop the multiplexed connection. Commands already holding a clone
    /// of it finish first.
    async fn close(&self) -> Result<(), StoreError> {
        if self.conn.lock().await.take().is_some() {
            info!("Redis presence store closed");
        }
        Ok(())
    }
}
