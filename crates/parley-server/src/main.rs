//! # Parley Server
//!
//! WebSocket chat relay backed by a shared presence store.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (redis at $REDIS_HOST or 127.0.0.1:6379)
//! parley
//!
//! # Run on a single node without redis
//! PARLEY_STORE__BACKEND=memory parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! ```
//!
//! Clients connect to `ws://<host>:<port>/ws?user=<name>&channel=<name>`.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use parley_core::Relay;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // An unreachable store is fatal
    let store = handlers::connect_store(&config).await?;
    let relay = Arc::new(Relay::with_config(store, config.relay.to_relay_config()));

    handlers::run_server(config, relay).await?;

    Ok(())
}
