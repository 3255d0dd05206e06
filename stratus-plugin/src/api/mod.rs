//! JSON-RPC API module for the stratus plugin.
//!
//! Exposes the executor to the query host over JSON-RPC (HTTP and WebSocket).

pub mod handlers;
pub mod server;

pub use server::start_server;
