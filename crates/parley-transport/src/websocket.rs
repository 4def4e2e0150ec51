//! WebSocket peer implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into a shared [`PeerSink`] and an
//! owned [`PeerStream`].

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::traits::{PeerSink, PeerStream, TransportError};

/// Split an upgraded WebSocket into its write and read halves.
#[must_use]
pub fn split_socket(socket: WebSocket, remote_addr: Option<SocketAddr>) -> (Arc<WsSink>, WsStream) {
    let (sink, stream) = socket.split();
    let is_open = Arc::new(AtomicBool::new(true));

    let sink = Arc::new(WsSink {
        sink: Mutex::new(sink),
        is_open: Arc::clone(&is_open),
        remote_addr,
    });
    let stream = WsStream { stream, is_open };

    (sink, stream)
}

/// The write half of a WebSocket peer.
pub struct WsSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    is_open: Arc<AtomicBool>,
    remote_addr: Option<SocketAddr>,
}

#[async_trait]
impl PeerSink for WsSink {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.to_owned()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// The read half of a WebSocket peer.
pub struct WsStream {
    stream: SplitStream<WebSocket>,
    is_open: Arc<AtomicBool>,
}

#[async_trait]
impl PeerStream for WsStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pongs are queued by the protocol layer itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }
}
