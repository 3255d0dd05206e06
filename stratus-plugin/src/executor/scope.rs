//! The sub-scan of a single scope.

use std::sync::Arc;
use stratus_core::prelude::*;
use tokio::sync::mpsc;
use tracing::debug;

use super::plan::{ScanPlan, Strategy};
use crate::adapter::ResourceAdapter;
use crate::hydrate::Hydrator;
use crate::rows;

/// Messages from scope tasks to the coordinator.
#[derive(Debug)]
pub(crate) enum ScopeMessage {
    Row(Row),
    Finished { scope: Scope, stats: ScopeStats },
    Failed { scope: Scope, error: ScanError, stats: ScopeStats },
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScopeStats {
    pub rows: u64,
    pub dropped: u64,
    /// The scope stopped with rows or pages it never delivered.
    pub cut_short: bool,
}

pub(crate) struct ScopeScan {
    pub plan: Arc<ScanPlan>,
    pub scope: Scope,
    pub adapter: ResourceAdapter,
    pub hydrator: Hydrator,
    pub tx: mpsc::Sender<ScopeMessage>,
    pub stop: CancelToken,
}

impl ScopeScan {
    pub async fn run(self) {
        let mut stats = ScopeStats::default();
        let message = match self.scan(&mut stats).await {
            Ok(()) => ScopeMessage::Finished {
                scope: self.scope.clone(),
                stats,
            },
            // Being stopped is not a failure of the scope
            Err(ScanError::Cancelled) => ScopeMessage::Finished {
                scope: self.scope.clone(),
                stats: ScopeStats {
                    cut_short: true,
                    ..stats
                },
            },
            Err(error) => ScopeMessage::Failed {
                scope: self.scope.clone(),
                error,
                stats,
            },
        };
        // The coordinator may already be gone
        let _ = self.tx.send(message).await;
    }

    async fn scan(&self, stats: &mut ScopeStats) -> Result<()> {
        let table = &self.plan.table;
        match &self.plan.strategy {
            Strategy::Get { identities } => {
                let handler = table.get.as_ref().ok_or_else(|| {
                    ScanError::Internal(format!("table '{}' has no get handler", table.name))
                })?;
                for (position, identity) in identities.iter().enumerate() {
                    let record = match self
                        .adapter
                        .get(&handler.kind, &self.scope, identity, &self.stop)
                        .await
                    {
                        Ok(record) => record,
                        Err(ScanError::NotFound(what)) => {
                            debug!(
                                "No {} [{}] in '{}': {}",
                                table.name, identity, self.scope, what
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if !self.emit(vec![record], stats).await? {
                        if position + 1 < identities.len() {
                            stats.cut_short = true;
                        }
                        break;
                    }
                }
            }
            Strategy::List { filter } => {
                let mut pager = self
                    .adapter
                    .paginate(&table.list.kind, &self.scope, filter.clone());
                while let Some(records) = pager.next_page(&self.stop).await? {
                    if !self.emit(records, stats).await? {
                        if !pager.is_exhausted() {
                            stats.cut_short = true;
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn limit_reached(&self, stats: &ScopeStats) -> bool {
        self.plan
            .limit
            .is_some_and(|limit| stats.rows >= limit as u64)
    }

    /// Hydration can only remove rows under the drop policy or a filter on
    /// hydrated columns.
    fn hydration_keeps_rows(&self) -> bool {
        if !self.plan.hydrate {
            return true;
        }
        let emit_partial = self
            .plan
            .table
            .hydrate
            .as_ref()
            .is_some_and(|h| h.policy == HydrationPolicy::EmitPartial);
        emit_partial && self.plan.hydrated_filter.is_empty()
    }

    /// Turn fetched records into rows and send them on. Returns `false` once
    /// this scope should stop fetching.
    async fn emit(&self, records: Vec<RawRecord>, stats: &mut ScopeStats) -> Result<bool> {
        let table = &self.plan.table;
        let mut batch: Vec<Row> = records
            .iter()
            .map(|record| rows::build_row(table, &self.scope, record))
            .filter(|row| self.plan.passes_base_filter(row))
            .collect();

        if let Some(limit) = self.plan.limit {
            if self.hydration_keeps_rows() {
                let wanted = usize::try_from((limit as u64).saturating_sub(stats.rows))
                    .unwrap_or(usize::MAX);
                if batch.len() > wanted {
                    stats.cut_short = true;
                    batch.truncate(wanted);
                }
            }
        }

        if self.plan.hydrate && !batch.is_empty() {
            let outcome = self
                .hydrator
                .hydrate(table, &self.scope, batch, &self.stop)
                .await?;
            stats.dropped += outcome.dropped;
            batch = outcome.rows;
            batch.retain(|row| self.plan.passes_hydrated_filter(row));
        }

        for row in batch {
            if self.limit_reached(stats) {
                stats.cut_short = true;
                return Ok(false);
            }
            if self.tx.send(ScopeMessage::Row(row)).await.is_err() {
                return Err(ScanError::Cancelled);
            }
            stats.rows += 1;
        }
        Ok(!self.limit_reached(stats) && !self.stop.is_cancelled())
    }
}
