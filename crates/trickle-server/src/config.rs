//! Server configuration.
//!
//! Configuration can be loaded from:
//! - An explicit `--config` path
//! - `trickle.toml`, `/etc/trickle/trickle.toml` or
//!   `~/.config/trickle/trickle.toml`, first found wins
//! - Environment variables: `TRICKLE_HOST` / `TRICKLE_PORT` as defaults,
//!   `TRICKLE__<SECTION>__<KEY>` overriding any field

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use trickle_core::HubConfig;

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

    /// Connection lifecycle configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Long-poll configuration.
    #[serde(default)]
    pub long_poll: LongPollConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the streaming and control endpoint.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Enable the long-poll transport.
    #[serde(default = "default_true")]
    pub long_poll: bool,

    /// Path for the long-poll endpoint.
    #[serde(default = "default_poll_path")]
    pub poll_path: String,

    /// Enable the WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Connection lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout")]
    pub timeout_ms: u64,

    /// Spaces written in the stream-open preamble.
    #[serde(default = "default_padding")]
    pub padding: usize,
}

/// Long-poll configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollConfig {
    /// How long one poll waits for frames, in milliseconds.
    #[serde(default = "default_poll_wait")]
    pub wait_ms: u64,

    /// How often idle sessions are swept, in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
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
    std::env::var("TRICKLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TRICKLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_stream_path() -> String {
    "/chat".to_string()
}

fn default_poll_path() -> String {
    "/chat/poll".to_string()
}

fn default_ws_path() -> String {
    "/chat/ws".to_string()
}

fn default_connection_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_padding() -> usize {
    trickle_protocol::DEFAULT_PADDING
}

fn default_poll_wait() -> u64 {
    trickle_transport::DEFAULT_POLL_WAIT.as_secs() * 1000
}

fn default_sweep_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
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
            connection: ConnectionConfig::default(),
            long_poll: LongPollConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stream_path: default_stream_path(),
            long_poll: true,
            poll_path: default_poll_path(),
            websocket: true,
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_connection_timeout(),
            padding: default_padding(),
        }
    }
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_poll_wait(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
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

impl Config {
    /// Load configuration from `explicit`, the default paths, or defaults,
    /// then apply `TRICKLE__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed, or an
    /// override has the wrong type.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let base = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::find_default_file() {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };

        base.with_env_overrides(None)
    }

    fn find_default_file() -> Option<PathBuf> {
        let config_paths = [
            "trickle.toml",
            "/etc/trickle/trickle.toml",
            "~/.config/trickle/trickle.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
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

    /// Layer `TRICKLE__SECTION__KEY` variables over this configuration.
    ///
    /// `env` replaces the process environment when given.
    fn with_env_overrides(self, env: Option<::config::Map<String, String>>) -> Result<Self> {
        let merged = ::config::Config::builder()
            .add_source(::config::Config::try_from(&self).context("Failed to layer config")?)
            .add_source(
                ::config::Environment::with_prefix("TRICKLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read environment overrides")?;

        merged
            .try_deserialize()
            .context("Invalid environment override")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Core settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            connection_timeout: Duration::from_millis(self.connection.timeout_ms),
            padding: self.connection.padding,
            max_connections: self.limits.max_connections,
        }
    }
}
