//! Peer abstraction traits for Parley.
//!
//! These traits define the interface every transport must provide so the
//! relay core never depends on a concrete connection type.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The write half of a peer connection.
///
/// Implementations serialize concurrent writers internally, so a sink can
/// be shared between a session and any number of channel subscribers.
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// Send a text message to the peer.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    ///
    /// Closing an already closed sink is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Get the remote address of the peer, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// The read half of a peer connection.
#[async_trait]
pub trait PeerStream: Send {
    /// Receive the next payload from the peer.
    ///
    /// Returns `Ok(None)` if the peer closed the connection in an orderly way
    /// and `Err` on any other failure.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// A sink shared between a session and the channel subscribers.
pub type SharedSink = Arc<dyn PeerSink>;

#[async_trait]
impl<S: PeerStream + ?Sized> PeerStream for Box<S> {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        (**self).recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            TransportError::SendFailed("broken pipe".into()).to_string(),
            "Send failed: broken pipe"
        );
    }
}
