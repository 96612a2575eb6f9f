//! # Trickle Server
//!
//! Streaming chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! trickle
//!
//! # Run with custom config
//! trickle --config /path/to/trickle.toml
//!
//! # Run with environment variables
//! TRICKLE_PORT=8080 TRICKLE_HOST=0.0.0.0 trickle
//! TRICKLE__CONNECTION__TIMEOUT_MS=60000 trickle
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trickle_server::{config::Config, handlers, metrics};

/// Streaming chat server.
#[derive(Debug, Parser)]
#[command(name = "trickle", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "trickle_server=debug,trickle_transport=debug,trickle_core=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load(cli.config.as_deref())?;

    tracing::info!("Starting Trickle server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
