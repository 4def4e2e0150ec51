//! In-memory peer implementation.
//!
//! [`pair`] returns the two server-side halves of a connection together with
//! a [`MemoryClient`] that plays the remote end. Used by tests and benches to
//! drive sessions without a network.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::traits::{PeerSink, PeerStream, TransportError};

/// What the client pushes towards the server.
#[derive(Debug)]
enum Inbound {
    Payload(Bytes),
    Close,
    Fail(String),
}

/// Create a connected in-memory peer.
#[must_use]
pub fn pair() -> (Arc<MemorySink>, MemoryStream, MemoryClient) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let is_open = Arc::new(AtomicBool::new(true));
    let fail_sends = Arc::new(AtomicBool::new(false));

    let sink = Arc::new(MemorySink {
        outbound: outbound_tx,
        echo: inbound_tx.clone(),
        is_open: Arc::clone(&is_open),
        fail_sends: Arc::clone(&fail_sends),
    });
    let stream = MemoryStream {
        inbound: inbound_rx,
        is_open: Arc::clone(&is_open),
    };
    let client = MemoryClient {
        inbound: inbound_tx,
        outbound: outbound_rx,
        is_open,
        fail_sends,
    };

    (sink, stream, client)
}

/// The write half of an in-memory peer.
#[derive(Debug)]
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<String>,
    echo: mpsc::UnboundedSender<Inbound>,
    is_open: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

#[async_trait]
impl PeerSink for MemorySink {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        self.outbound
            .send(text.to_owned())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // A real client answers a close frame with its own.
        let _ = self.echo.send(Inbound::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// The read half of an in-memory peer.
#[derive(Debug)]
pub struct MemoryStream {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    is_open: Arc<AtomicBool>,
}

#[async_trait]
impl PeerStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.inbound.recv().await {
            Some(Inbound::Payload(data)) => Ok(Some(data)),
            Some(Inbound::Close) | None => {
                self.is_open.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Some(Inbound::Fail(reason)) => {
                self.is_open.store(false, Ordering::SeqCst);
                Err(TransportError::ReceiveFailed(reason))
            }
        }
    }
}

/// The remote end of an in-memory peer.
#[derive(Debug)]
pub struct MemoryClient {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<String>,
    is_open: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl MemoryClient {
    /// Send a text payload to the server.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self
            .inbound
            .send(Inbound::Payload(Bytes::from(text.into())));
    }

    /// Close the connection in an orderly way.
    pub fn close(&self) {
        let _ = self.inbound.send(Inbound::Close);
    }

    /// Break the connection with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Inbound::Fail(reason.into()));
    }

    /// Make every subsequent server-side write fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Receive the next message written by the server.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Receive the next message, giving up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take every message already written by the server.
    pub fn drain(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Check whether the server side still considers the connection open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
