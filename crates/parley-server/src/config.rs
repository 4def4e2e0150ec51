//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`parley.toml`, `/etc/parley/parley.toml`,
//!   `~/.config/parley/parley.toml`)
//! - Environment variables (`PARLEY_*`, nested keys joined with `__`, e.g.
//!   `PARLEY_STORE__URL`)

use anyhow::{Context, Result};
use parley_core::{RelayConfig, UsernamePolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Presence store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Session and fanout behaviour.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Presence store backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server.
    #[default]
    Redis,
    /// In-process store; state is not shared between servers.
    Memory,
}

/// Presence store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL.
    #[serde(default = "default_store_url")]
    pub url: String,
}

/// Session and fanout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// What to do with a username that is already active.
    #[serde(default)]
    pub username_policy: UsernamePolicy,

    /// Per-delivery write timeout in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_store_url() -> String {
    std::env::var("REDIS_HOST")
        .map(|host| format!("redis://{host}"))
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_send_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            store: StoreConfig::default(),
            relay: RelaySettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            username_policy: UsernamePolicy::default(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl RelaySettings {
    /// Convert into the core relay configuration.
    #[must_use]
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            username_policy: self.username_policy,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `PARLEY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(config::File::new(
                    expanded.as_ref(),
                    config::FileFormat::Toml,
                ));
                break;
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
