//! JSON-RPC server for the stratus plugin.

use anyhow::{Context, Result};
use jsonrpsee::server::{Server, ServerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::handlers::{ApiImpl, StratusApiServer};
use crate::executor::Executor;

/// Start the JSON-RPC server on `bind_address`, serving HTTP and WebSocket on
/// the same port.
///
/// Returns the handle that keeps the server running and the bound address
/// (useful when binding to port 0).
pub async fn start_server(
    bind_address: &str,
    executor: Arc<Executor>,
) -> Result<(ServerHandle, SocketAddr)> {
    info!("Starting JSON-RPC server on {}", bind_address);

    let server = Server::builder()
        .build(bind_address)
        .await
        .with_context(|| format!("Failed to bind JSON-RPC server to {bind_address}"))?;

    let addr = server
        .local_addr()
        .context("Failed to get server address")?;

    let handle = server.start(ApiImpl::new(executor).into_rpc());
    info!("JSON-RPC server listening on {}", addr);

    Ok((handle, addr))
}
