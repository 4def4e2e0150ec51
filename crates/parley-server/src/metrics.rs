//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::SessionError;
use parley_transport::{PeerStream, TransportError};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const SESSIONS_REJECTED: &str = "parley_sessions_rejected_total";
    pub const MESSAGES_INBOUND: &str = "parley_messages_inbound_total";
    pub const MESSAGES_BYTES: &str = "parley_messages_inbound_bytes";
    pub const CHANNELS_ACTIVE: &str = "parley_channels_active";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::SESSIONS_REJECTED,
        "Connections that failed to join, by reason"
    );
    metrics::describe_counter!(names::MESSAGES_INBOUND, "Total messages read from clients");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes read from clients");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Channels with a running subscriber");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Label for a failed join.
#[must_use]
pub fn rejection_reason(error: &SessionError) -> &'static str {
    match error {
        SessionError::InvalidName(_) => "invalid_name",
        SessionError::Store(_) => "store",
        SessionError::UsernameTaken(_) => "username_taken",
        SessionError::ShuttingDown => "shutting_down",
        SessionError::InvalidState(_) => "invalid_state",
    }
}

/// Record a connection that failed to join.
pub fn record_rejection(error: &SessionError) {
    counter!(names::SESSIONS_REJECTED, "reason" => rejection_reason(error)).increment(1);
}

/// Record an inbound message.
pub fn record_message(bytes: usize) {
    counter!(names::MESSAGES_INBOUND).increment(1);
    counter!(names::MESSAGES_BYTES).increment(bytes as u64);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Read half that counts every inbound payload.
pub struct CountingStream<S> {
    inner: S,
}

impl<S> CountingStream<S> {
    /// Wrap a read half.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: PeerStream> PeerStream for CountingStream<S> {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let received = self.inner.recv().await;
        if let Ok(Some(payload)) = &received {
            record_message(payload.len());
        }
        received
    }
}
