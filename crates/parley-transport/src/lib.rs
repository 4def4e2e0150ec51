//! # parley-transport
//!
//! Peer connection abstraction for the Parley chat relay.
//!
//! A connected client is seen by the relay as two halves:
//!
//! - **[`PeerSink`]** - the shared write half, held by the session and by every
//!   channel subscriber that may deliver to it
//! - **[`PeerStream`]** - the read half, owned by the session's receive loop
//!
//! Two implementations are provided: an axum WebSocket adapter (feature
//! `websocket`, on by default) and an in-memory pair for tests.
//!
//! ```rust,ignore
//! use parley_transport::{PeerStream, TransportError};
//!
//! async fn pump(mut stream: impl PeerStream) -> Result<(), TransportError> {
//!     while let Some(payload) = stream.recv().await? {
//!         // Process payload
//!     }
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{PeerSink, PeerStream, SharedSink, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{split_socket, WsSink, WsStream};
