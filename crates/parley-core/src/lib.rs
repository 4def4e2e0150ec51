//! # parley-core
//!
//! Session lifecycle, presence tracking and channel fanout for the Parley
//! chat relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Store** - Presence store adapter (Redis or in-process)
//! - **Session** - One connected user's join/active/leave lifecycle
//! - **Subscriber** - One delivery task per active channel
//! - **Registry** - Joined connections, keyed per connection
//! - **Relay** - The shared context tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish  ┌─────────────┐  subscribe  ┌─────────────┐
//! │ ChatSession │──────────▶│    Store    │────────────▶│ Subscriber  │
//! └─────────────┘           └─────────────┘             └─────────────┘
//!        │ register                                            │ snapshot
//!        ▼                                                     ▼
//!                 ┌──────────────────────────────────────┐
//!                 │           SessionRegistry            │
//!                 └──────────────────────────────────────┘
//! ```

pub mod error;
pub mod keys;
pub mod registry;
pub mod relay;
pub mod session;
pub mod stats;
pub mod store;
pub mod subscriber;

pub use error::{SessionError, StoreError};
pub use registry::{PeerKey, SessionRegistry};
pub use relay::{Relay, RelayConfig, RelayStatus, UsernamePolicy};
pub use session::{ChatSession, SessionExit, SessionState};
pub use stats::{RelayStats, StatsSnapshot};
pub use store::{MemoryStore, PresenceStore, Subscription};
pub use subscriber::{ChannelSubscriber, SubscriberRegistry};

#[cfg(feature = "redis")]
pub use store::RedisStore;
