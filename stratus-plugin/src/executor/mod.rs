//! # Query Executor
//!
//! Turns a [`ScanRequest`] into a stream of [`ScanEvent`]s.
//!
//! Each scan is planned synchronously (so invalid requests fail before any
//! task is spawned), then run by a coordinator task that fans out one task per
//! scope, merges their rows into a bounded channel, enforces the row limit and
//! the scope error policy, and finishes the stream with a [`ScanSummary`].
//!
//! ```text
//!            +--> scope task (region-1) --+
//! execute ---+--> scope task (region-2) --+--> coordinator --> ScanStream
//!            +--> scope task (region-3) --+
//! ```

mod plan;
mod scope;

pub use plan::{ScanPlan, Strategy};

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use stratus_core::prelude::*;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterStats, ResourceAdapter, RetryPolicy};
use crate::hydrate::Hydrator;
use crate::registry::TableRegistry;
use scope::{ScopeMessage, ScopeScan, ScopeStats};

/// What a scan does when one of its scopes fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeErrorPolicy {
    /// Record the failure in the summary and keep the other scopes running.
    #[default]
    PartialSuccess,
    /// Stop every scope and end the stream with [`ScanEvent::Failed`].
    FailFast,
}

/// Deployment-wide execution settings.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub regions: Vec<String>,
    pub scope_error_policy: ScopeErrorPolicy,
    pub max_concurrent_scopes: usize,
    pub hydrate_workers: usize,
    pub page_size: u32,
    pub channel_capacity: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            regions: vec!["region-1".to_string()],
            scope_error_policy: ScopeErrorPolicy::default(),
            max_concurrent_scopes: 8,
            hydrate_workers: 4,
            page_size: 100,
            channel_capacity: 256,
        }
    }
}

/// Executes scans against one provider.
pub struct Executor {
    registry: Arc<TableRegistry>,
    adapter: ResourceAdapter,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(
        registry: Arc<TableRegistry>,
        client: Arc<dyn ResourceClient>,
        retry: RetryPolicy,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            adapter: ResourceAdapter::new(client, retry),
            options,
        }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn client_name(&self) -> &str {
        self.adapter.client_name()
    }

    /// Calls issued to the provider by every scan so far.
    pub fn adapter_stats(&self) -> AdapterStats {
        self.adapter.stats()
    }

    /// Host-facing schema of every table.
    pub fn schema(&self) -> Vec<TableSummary> {
        self.registry.summaries()
    }

    /// Validate a request and choose how it will run, without running it.
    pub fn plan(&self, request: &ScanRequest) -> Result<ScanPlan> {
        let table = self.registry.lookup(&request.table)?;
        plan::plan(table, request, &self.options.regions, self.options.page_size)
    }

    /// Start a scan.
    ///
    /// Invalid requests fail here, before any task is spawned. Must be called
    /// from within a tokio runtime.
    pub fn execute(&self, request: ScanRequest) -> Result<ScanStream> {
        let plan = Arc::new(self.plan(&request)?);
        let scan_id = Uuid::new_v4();

        info!(
            "Scan {} on '{}': {} strategy over {} scope(s), {} local filter(s), hydrate: {}",
            scan_id,
            plan.table.name,
            plan.strategy.name(),
            plan.scopes.len(),
            plan.base_filter.len() + plan.hydrated_filter.len(),
            plan.hydrate
        );

        let capacity = self.options.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stop = CancelToken::new();

        let coordinator = Coordinator {
            scan_id,
            plan,
            adapter: self.adapter.clone(),
            hydrator: Hydrator::new(self.adapter.clone(), self.options.hydrate_workers),
            policy: self.options.scope_error_policy,
            max_concurrent_scopes: self.options.max_concurrent_scopes.max(1),
            capacity,
            cancel: request.cancel,
            stop: stop.clone(),
            out: tx,
        };
        tokio::spawn(coordinator.run());

        Ok(ScanStream { scan_id, rx, stop })
    }
}

// ============================================================================
// Scan Stream
// ============================================================================

/// A scan's complete result.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub rows: Vec<Row>,
    pub summary: ScanSummary,
}

/// Events of one running scan.
///
/// The stream always ends with exactly one [`ScanEvent::Done`] or
/// [`ScanEvent::Failed`]. Dropping it stops the scan.
pub struct ScanStream {
    scan_id: Uuid,
    rx: mpsc::Receiver<ScanEvent>,
    stop: CancelToken,
}

impl ScanStream {
    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    pub async fn next(&mut self) -> Option<ScanEvent> {
        self.rx.recv().await
    }

    /// Blocking variant of [`ScanStream::next`] for synchronous hosts. Must
    /// not be called from within an async context.
    pub fn blocking_next(&mut self) -> Option<ScanEvent> {
        self.rx.blocking_recv()
    }

    /// Stop the scan. Events already queued are still delivered, followed by
    /// the summary.
    pub fn cancel(&self) {
        self.stop.cancel();
    }

    /// Drain the stream into rows and the summary.
    pub async fn collect(mut self) -> Result<ScanOutcome> {
        let mut rows = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                ScanEvent::Row(row) => rows.push(row),
                ScanEvent::Done(summary) => return Ok(ScanOutcome { rows, summary }),
                ScanEvent::Failed { error, .. } => return Err(error),
            }
        }
        Err(ScanError::Internal("scan ended without a summary".to_string()))
    }
}

impl Stream for ScanStream {
    type Item = ScanEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// What the coordinator has heard back from its scopes.
#[derive(Debug, Default)]
struct Progress {
    reported: usize,
    cut_short: bool,
}

struct Coordinator {
    scan_id: Uuid,
    plan: Arc<ScanPlan>,
    adapter: ResourceAdapter,
    hydrator: Hydrator,
    policy: ScopeErrorPolicy,
    max_concurrent_scopes: usize,
    capacity: usize,
    /// The host's cancellation signal.
    cancel: CancelToken,
    /// Internal signal telling scope tasks to stop.
    stop: CancelToken,
    out: mpsc::Sender<ScanEvent>,
}

impl Coordinator {
    fn merge_stats(summary: &mut ScanSummary, progress: &mut Progress, stats: &ScopeStats) {
        summary.rows_dropped += stats.dropped;
        progress.reported += 1;
        progress.cut_short |= stats.cut_short;
    }

    async fn run(self) {
        let started = Instant::now();
        let mut summary = ScanSummary::new(
            self.scan_id,
            &self.plan.table.name,
            self.plan.strategy.name(),
            self.plan.scope_names(),
        );

        if self.plan.is_empty() {
            debug!("Scan {} has nothing to fetch", self.scan_id);
            summary.truncated = self.plan.limit == Some(0);
            let _ = self.out.send(ScanEvent::Done(summary)).await;
            return;
        }

        let (scope_tx, mut scope_rx) = mpsc::channel(self.capacity);
        let permits = Arc::new(Semaphore::new(self.max_concurrent_scopes));
        let mut tasks = JoinSet::new();

        for scope in &self.plan.scopes {
            let scan = ScopeScan {
                plan: self.plan.clone(),
                scope: scope.clone(),
                adapter: self.adapter.clone(),
                hydrator: self.hydrator.clone(),
                tx: scope_tx.clone(),
                stop: self.stop.clone(),
            };
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if scan.stop.is_cancelled() {
                    return;
                }
                scan.run().await;
            });
        }
        drop(scope_tx);

        let mut terminal: Option<ScanError> = None;
        let mut progress = Progress::default();
        let mut limit_hit = false;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = self.stop.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                message = scope_rx.recv() => match message {
                    None => break,
                    Some(ScopeMessage::Row(row)) => {
                        if row.hydrate_error().is_some() {
                            summary.rows_with_hydrate_errors += 1;
                        }
                        let sent = tokio::select! {
                            sent = self.out.send(ScanEvent::Row(row)) => sent.is_ok(),
                            _ = self.cancel.cancelled() => false,
                            _ = self.stop.cancelled() => false,
                        };
                        if !sent {
                            summary.cancelled = true;
                            break;
                        }
                        summary.rows_emitted += 1;
                        let limit = self.plan.limit;
                        if limit.is_some_and(|limit| summary.rows_emitted >= limit as u64) {
                            limit_hit = true;
                            break;
                        }
                    }
                    Some(ScopeMessage::Finished { scope, stats }) => {
                        debug!(
                            "Scan {}: scope '{}' finished with {} rows",
                            self.scan_id, scope, stats.rows
                        );
                        Self::merge_stats(&mut summary, &mut progress, &stats);
                    }
                    Some(ScopeMessage::Failed { scope, error, stats }) => {
                        warn!("Scan {}: scope '{}' failed: {}", self.scan_id, scope, error);
                        Self::merge_stats(&mut summary, &mut progress, &stats);
                        summary.failures.push(ScopeFailure::new(scope.as_str(), &error));
                        if self.policy == ScopeErrorPolicy::FailFast {
                            terminal = Some(error);
                            break;
                        }
                    }
                },
            }
        }

        // Stop the remaining scopes and wait for them, so no call is issued
        // after the stream ends.
        self.stop.cancel();
        while let Some(message) = scope_rx.recv().await {
            match message {
                ScopeMessage::Row(_) => progress.cut_short = true,
                ScopeMessage::Finished { stats, .. } => {
                    Self::merge_stats(&mut summary, &mut progress, &stats)
                }
                ScopeMessage::Failed { scope, error, stats } => {
                    Self::merge_stats(&mut summary, &mut progress, &stats);
                    if terminal.is_none() {
                        summary.failures.push(ScopeFailure::new(scope.as_str(), &error));
                    }
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Scan {}: scope task panicked: {}", self.scan_id, e);
                summary
                    .failures
                    .push(ScopeFailure::new("unknown", &ScanError::Internal(e.to_string())));
            }
        }

        // The limit only truncated the scan if something was left undelivered:
        // a row past the limit, a scope that stopped early, or one never started.
        if limit_hit {
            summary.truncated = progress.cut_short || progress.reported < self.plan.scopes.len();
        }

        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "Scan {} on '{}' finished: {} rows, {} dropped, {} partial, {} failed scope(s), \
             truncated: {}, cancelled: {}, {} ms",
            self.scan_id,
            summary.table,
            summary.rows_emitted,
            summary.rows_dropped,
            summary.rows_with_hydrate_errors,
            summary.failures.len(),
            summary.truncated,
            summary.cancelled,
            summary.duration_ms
        );

        let last = match terminal {
            Some(error) => ScanEvent::Failed { error, summary },
            None => ScanEvent::Done(summary),
        };
        let _ = self.out.send(last).await;
    }
}
