//! # stratus-plugin
//!
//! Exposes cloud compute resources to a SQL query host as virtual tables.
//!
//! The plugin is responsible for:
//! - Serving the schema of every virtual table
//! - Translating each host scan into paginated, region-fanned-out API calls
//! - Hydrating rows with per-resource detail calls
//! - Streaming rows back over JSON-RPC
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      stratus-plugin                       │
//! │                                                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │    Table     │  │   Executor   │  │   Resource   │     │
//! │  │   Registry   │  │  (fan-out)   │  │   Adapter    │     │
//! │  └──────────────┘  └──────────────┘  └──────────────┘     │
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────┐      │
//! │  │              JSON-RPC API Server                │      │
//! │  │              (HTTP / WebSocket)                 │      │
//! │  └─────────────────────────────────────────────────┘      │
//! └───────────────────────────────────────────────────────────┘
//!                  │                          │
//!                  ▼                          ▼
//!           ┌────────────┐            ┌──────────────┐
//!           │ Query host │            │ Compute API  │
//!           └────────────┘            └──────────────┘
//! ```
//!
//! ## Configuration
//!
//! Read from `$XDG_CONFIG_HOME/stratus/config.toml`; the access token comes
//! from `$STRATUS_ACCESS_TOKEN` unless set inline.
//!
//! ## Running
//!
//! ```bash
//! cargo run --bin stratus-plugin
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin stratus-plugin
//! ```

use anyhow::{Context, Result};
use provider_compute::{ComputeClient, ComputeConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stratus_plugin::api;
use stratus_plugin::config::Config;
use stratus_plugin::executor::Executor;
use stratus_plugin::registry::TableRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let loaded = Config::load_default();
    let log_level = loaded
        .as_ref()
        .map(|c| c.plugin.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .with_target(true)
        .init();

    info!("Starting stratus-plugin v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from default path");
            cfg
        }
        Err(e) => {
            warn!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        }
    };

    let registry = TableRegistry::from_tables(provider_compute::tables())
        .context("Invalid built-in table definitions")?;
    info!("Registered {} table(s): {:?}", registry.count(), registry.list());

    let client = ComputeClient::new(ComputeConfig {
        endpoint: config.connection.endpoint.clone(),
        access_token: config.access_token()?,
        timeout: config.request_timeout(),
        user_agent: format!("stratus-plugin/{}", env!("CARGO_PKG_VERSION")),
    })
    .context("Failed to build compute client")?;

    info!(
        "Scanning {} region(s) at {}",
        config.connection.regions.len(),
        config.connection.endpoint
    );

    let executor = Arc::new(Executor::new(
        Arc::new(registry),
        Arc::new(client),
        config.retry_policy(),
        config.executor_options(),
    ));

    let (server_handle, addr) = api::start_server(&config.plugin.bind_address, executor).await?;

    info!("Plugin startup complete");
    info!("Listening on: {}", addr);
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    server_handle.stop()?;
    server_handle.stopped().await;

    info!("Plugin stopped");
    Ok(())
}
