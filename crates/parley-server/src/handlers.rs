//! Connection handlers for the Parley server.
//!
//! This module wires HTTP routing and WebSocket upgrades to chat sessions.

use crate::config::{Config, StoreBackend};
use crate::metrics::{self, ConnectionMetricsGuard, CountingStream};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parley_core::{ChatSession, MemoryStore, PresenceStore, Relay, SessionExit};
use parley_transport::split_socket;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The chat relay.
    pub relay: Arc<Relay>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(relay: Arc<Relay>, config: Config) -> Self {
        Self { relay, config }
    }
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct JoinParams {
    /// Username to join as.
    pub user: String,
    /// Channel to join.
    pub channel: String,
}

/// Open the configured presence store and check that it answers.
///
/// # Errors
///
/// Returns an error if the store cannot be reached.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn PresenceStore>> {
    let store: Arc<dyn PresenceStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            parley_core::RedisStore::connect(&config.store.url)
                .await
                .with_context(|| format!("Failed to connect to redis at {}", config.store.url))?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-process store; presence is not shared between servers");
            Arc::new(MemoryStore::new())
        }
    };

    store
        .ping()
        .await
        .context("Presence store did not answer ping")?;
    info!(backend = ?config.store.backend, "Connected to presence store");

    Ok(store)
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, relay: Arc<Relay>) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(Arc::clone(&relay), config));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}?user=<name>&channel=<name>", addr, ws_path);

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(relay))
    .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C, then tear the relay down.
async fn shutdown_signal(relay: Arc<Relay>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Shutdown signal received");
    relay.shutdown().await;
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Relay counters and registry sizes.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.status().await)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, params, state))
}

/// Drive one WebSocket connection through a chat session.
async fn handle_websocket(
    socket: WebSocket,
    addr: SocketAddr,
    params: JoinParams,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    debug!(%addr, user = %params.user, channel = %params.channel, "WebSocket connected");

    let (sink, stream) = split_socket(socket, Some(addr));
    let mut session = ChatSession::new(
        Arc::clone(&state.relay),
        params.user,
        params.channel,
        sink,
    );

    if let Err(e) = session.start().await {
        debug!(%addr, error = %e, "Session did not join");
        metrics::record_rejection(&e);
        return;
    }
    metrics::set_active_channels(state.relay.subscribers().len().await);

    match session.run(CountingStream::new(stream)).await {
        SessionExit::Closed => debug!(%addr, "WebSocket closed"),
        SessionExit::Failed(e) => {
            debug!(%addr, error = %e, "WebSocket failed");
            metrics::record_error("websocket");
        }
    }
}
