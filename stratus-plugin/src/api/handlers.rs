//! JSON-RPC API handlers for the stratus plugin.
//!
//! The host talks to the plugin through these methods. Scans can be run to
//! completion (`scan.execute`) or streamed as a subscription (`scan.subscribe`),
//! where closing the subscription cancels the scan.

use jsonrpsee::core::{async_trait, RpcResult, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::{PendingSubscriptionSink, SubscriptionMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stratus_core::prelude::*;
use tracing::debug;

use crate::executor::Executor;

// ============================================================================
// Wire Types
// ============================================================================

/// A qualifier as sent by the host. `value` is a JSON literal, or an array of
/// literals for `IN` / `NOT IN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualDto {
    pub column: String,
    pub op: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequestDto {
    pub table: String,
    #[serde(default)]
    pub quals: Vec<QualDto>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ScanRequestDto {
    pub fn into_request(self) -> Result<ScanRequest> {
        let quals = self
            .quals
            .into_iter()
            .map(|qual| -> Result<Qualifier> {
                let operator: Operator = qual.op.parse()?;
                let value = match qual.value {
                    serde_json::Value::Array(items) => {
                        QualValue::List(items.into_iter().map(Value::Json).collect())
                    }
                    literal => QualValue::Single(Value::Json(literal)),
                };
                Ok(Qualifier {
                    column: qual.column,
                    operator,
                    value,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut request = ScanRequest::new(&self.table).with_columns(self.columns);
        request.quals = quals;
        request.limit = self.limit;
        Ok(request)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResultDto {
    pub rows: Vec<Row>,
    pub summary: ScanSummary,
}

/// One notification of a `scan.subscribe` subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEventDto {
    Row {
        row: Row,
    },
    Done {
        summary: ScanSummary,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        summary: ScanSummary,
    },
}

impl From<ScanEvent> for ScanEventDto {
    fn from(event: ScanEvent) -> Self {
        match event {
            ScanEvent::Row(row) => ScanEventDto::Row { row },
            ScanEvent::Done(summary) => ScanEventDto::Done { summary },
            ScanEvent::Failed { error, summary } => ScanEventDto::Failed {
                kind: error.kind(),
                message: error.to_string(),
                summary,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHealth {
    pub name: String,
    pub version: String,
    pub client: String,
    pub tables: usize,
    pub regions: Vec<String>,
}

/// JSON-RPC error code for a scan error kind.
pub fn error_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Schema => -32602,
        ErrorKind::Auth => -32001,
        ErrorKind::RateLimitExceeded => -32002,
        ErrorKind::Provider => -32003,
        ErrorKind::NotFound => -32004,
        ErrorKind::Cancelled => -32005,
        ErrorKind::Hydration => -32006,
        ErrorKind::Internal => -32603,
    }
}

fn rpc_error(error: &ScanError) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(
        error_code(error.kind()),
        error.to_string(),
        Some(serde_json::json!({ "kind": error.kind() })),
    )
}

// ============================================================================
// RPC Interface
// ============================================================================

#[rpc(server)]
pub trait StratusApi {
    /// Schema of every table the plugin serves.
    #[method(name = "plugin.schema")]
    async fn schema(&self) -> RpcResult<Vec<TableSummary>>;

    #[method(name = "plugin.health")]
    async fn health(&self) -> RpcResult<PluginHealth>;

    /// Run a scan to completion.
    #[method(name = "scan.execute")]
    async fn execute(&self, request: ScanRequestDto) -> RpcResult<ScanResultDto>;

    /// Stream a scan's events as they are produced.
    #[subscription(
        name = "scan.subscribe" => "scan.event",
        unsubscribe = "scan.unsubscribe",
        item = ScanEventDto
    )]
    async fn subscribe(&self, request: ScanRequestDto) -> SubscriptionResult;
}

pub struct ApiImpl {
    executor: Arc<Executor>,
}

impl ApiImpl {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StratusApiServer for ApiImpl {
    async fn schema(&self) -> RpcResult<Vec<TableSummary>> {
        Ok(self.executor.schema())
    }

    async fn health(&self) -> RpcResult<PluginHealth> {
        Ok(PluginHealth {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client: self.executor.client_name().to_string(),
            tables: self.executor.registry().count(),
            regions: self.executor.options().regions.clone(),
        })
    }

    async fn execute(&self, request: ScanRequestDto) -> RpcResult<ScanResultDto> {
        let request = request.into_request().map_err(|e| rpc_error(&e))?;
        let stream = self.executor.execute(request).map_err(|e| rpc_error(&e))?;
        let outcome = stream.collect().await.map_err(|e| rpc_error(&e))?;
        Ok(ScanResultDto {
            rows: outcome.rows,
            summary: outcome.summary,
        })
    }

    async fn subscribe(
        &self,
        pending: PendingSubscriptionSink,
        request: ScanRequestDto,
    ) -> SubscriptionResult {
        let started = request
            .into_request()
            .and_then(|request| self.executor.execute(request));
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                pending.reject(rpc_error(&e)).await;
                return Ok(());
            }
        };

        let sink = pending.accept().await?;
        let scan_id = stream.scan_id();
        loop {
            tokio::select! {
                _ = sink.closed() => {
                    debug!("Subscriber of scan {} went away, cancelling", scan_id);
                    stream.cancel();
                    break;
                }
                event = stream.next() => {
                    let Some(event) = event else { break };
                    let last = !matches!(event, ScanEvent::Row(_));
                    let message = SubscriptionMessage::from_json(&ScanEventDto::from(event))?;
                    sink.send(message).await?;
                    if last {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
