//! Per-row detail fetches.
//!
//! A page of base rows is hydrated through an order-preserving pool: at most
//! `workers` detail calls are in flight at once and rows come out in the order
//! they went in. A failed call affects only its own row, as decided by the
//! table's [`HydrationPolicy`].

use futures::stream::{self, StreamExt};
use stratus_core::prelude::*;
use tracing::{debug, warn};

use crate::adapter::ResourceAdapter;
use crate::rows;

/// Rows that survived hydration, plus what happened to the rest.
#[derive(Debug, Default)]
pub struct HydrationOutcome {
    pub rows: Vec<Row>,
    /// Rows left out under [`HydrationPolicy::Drop`].
    pub dropped: u64,
    /// Rows emitted with the hydrate error marker under
    /// [`HydrationPolicy::EmitPartial`].
    pub partial: u64,
}

#[derive(Clone)]
pub struct Hydrator {
    adapter: ResourceAdapter,
    workers: usize,
}

impl Hydrator {
    pub fn new(adapter: ResourceAdapter, workers: usize) -> Self {
        Self {
            adapter,
            workers: workers.max(1),
        }
    }

    /// Hydrate one page of rows fetched from `scope`.
    ///
    /// Fails only on cancellation; every other error is absorbed per row.
    pub async fn hydrate(
        &self,
        table: &TableDefinition,
        scope: &Scope,
        rows: Vec<Row>,
        cancel: &CancelToken,
    ) -> Result<HydrationOutcome> {
        let Some(handler) = table.hydrate.as_ref() else {
            return Ok(HydrationOutcome {
                rows,
                ..Default::default()
            });
        };

        let adapter = &self.adapter;
        let results: Vec<(Row, Result<RawRecord>)> = stream::iter(rows)
            .map(|row| async move {
                let detail = match rows::identity_of(&row, &handler.identity_columns) {
                    Some(identity) => adapter.get(&handler.kind, scope, &identity, cancel).await,
                    None => Err(ScanError::Hydration(format!(
                        "row has no value for identity columns {:?}",
                        handler.identity_columns
                    ))),
                };
                (row, detail)
            })
            .buffered(self.workers)
            .collect()
            .await;

        let mut outcome = HydrationOutcome::default();
        for (mut row, detail) in results {
            match detail {
                Ok(detail) => {
                    rows::merge_hydrated(table, &mut row, &detail);
                    outcome.rows.push(row);
                }
                Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                Err(error) => match handler.policy {
                    HydrationPolicy::EmitPartial => {
                        debug!(
                            "Hydration failed for a {} row in '{}': {}",
                            table.name, scope, error
                        );
                        row.mark_hydrate_error(error.to_string());
                        outcome.partial += 1;
                        outcome.rows.push(row);
                    }
                    HydrationPolicy::Drop => {
                        debug!("Dropping {} row in '{}': {}", table.name, scope, error);
                        outcome.dropped += 1;
                    }
                },
            }
        }

        if outcome.partial + outcome.dropped > 0 {
            warn!(
                "Hydration of {} in '{}': {} partial, {} dropped",
                table.name, scope, outcome.partial, outcome.dropped
            );
        }
        Ok(outcome)
    }
}
