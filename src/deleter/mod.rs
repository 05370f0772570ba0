//! # Table Deleter
//!
//! Per-table state machine owning the row-count bookkeeping for one node.
//!
//! A deleter is driven by exactly one execution unit at a time. Every change is
//! published as a whole [`TableSnapshot`] through a `watch` channel, so
//! concurrent readers only ever observe complete point-in-time views, and is
//! mirrored onto the coordinator's event stream.
//!
//! Direct deletion issues bounded batches and decrements `remained_rows` by
//! the affected count of each batch. Cascade deletion never calls delete; it
//! re-measures the table until the owner's cascade has emptied it.

mod status;

pub use status::{DeletionStatus, TableSnapshot};

use crate::backoff::BackoffCalculator;
use crate::config::TruncateConfig;
use crate::error::{PermanentKind, Result, StorageError, StorageResult, TruncateError};
use crate::events::{DeletionEvent, EventPublisher};
use crate::graph::NodeId;
use crate::storage::TableStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive zero-progress batches tolerated before a table is declared stuck
const MAX_STALLED_BATCHES: u32 = 3;

/// Progress of the node whose delete cascades onto a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    Deleting,
    /// The owner's own rows are gone
    Finished,
    Failed,
}

/// How a cascade unit ended without completing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeExit {
    Completed,
    OwnerFailed,
}

/// Shared resources for every execution unit of a run
#[derive(Clone)]
pub struct UnitContext {
    pub store: Arc<dyn TableStore>,
    pub config: Arc<TruncateConfig>,
    pub backoff: BackoffCalculator,
    pub batch_permits: Arc<Semaphore>,
    pub count_permits: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

impl UnitContext {
    pub fn new(store: Arc<dyn TableStore>, config: Arc<TruncateConfig>, cancel: CancellationToken) -> Self {
        Self {
            backoff: BackoffCalculator::new(config.retry.clone()),
            batch_permits: Arc::new(Semaphore::new(config.max_in_flight_batches)),
            count_permits: Arc::new(Semaphore::new(config.max_concurrent_counts)),
            store,
            config,
            cancel,
        }
    }
}

pub struct TableDeleter {
    node: NodeId,
    table: String,
    where_clause: Arc<str>,
    snapshot: watch::Sender<TableSnapshot>,
    events: EventPublisher,
}

impl std::fmt::Debug for TableDeleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDeleter")
            .field("node", &self.node)
            .field("table", &self.table)
            .field("status", &self.status())
            .finish()
    }
}

impl TableDeleter {
    pub fn new(node: NodeId, table: impl Into<String>, where_clause: Arc<str>, events: EventPublisher) -> Self {
        let table = table.into();
        let (snapshot, _) = watch::channel(TableSnapshot::new(node, table.clone()));
        Self {
            node,
            table,
            where_clause,
            snapshot,
            events,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> DeletionStatus {
        self.snapshot.borrow().status
    }

    /// Watch every published snapshot of this table
    pub fn subscribe(&self) -> watch::Receiver<TableSnapshot> {
        self.snapshot.subscribe()
    }

    /// Move to `next`, refusing anything but a forward step
    pub fn transition(&self, next: DeletionStatus) -> Result<()> {
        let mut outcome = Ok(None);
        self.snapshot.send_if_modified(|snap| {
            if !snap.status.can_transition_to(&next) {
                outcome = Err(TruncateError::InvalidTransition {
                    table: self.table.clone(),
                    from: snap.status.to_string(),
                    to: next.to_string(),
                });
                return false;
            }
            let from = std::mem::replace(&mut snap.status, next);
            snap.updated_at = Utc::now();
            outcome = Ok(Some(from));
            true
        });

        if let Some(from) = outcome? {
            debug!(table = %self.table, from = %from, to = %next, "status changed");
            self.events.publish(DeletionEvent::StatusChanged {
                node: self.node,
                table: self.table.clone(),
                from,
                to: next,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Record a permanent failure on the published snapshot
    pub fn mark_failed(&self, error: &TruncateError) {
        self.snapshot.send_modify(|snap| {
            snap.failure = Some(error.to_string());
            snap.updated_at = Utc::now();
        });
        self.events.publish(DeletionEvent::NodeFailed {
            node: self.node,
            table: self.table.clone(),
            error: error.to_string(),
        });
    }

    /// Count matching rows and move from Analyzing to Waiting
    pub async fn analyze(&self, ctx: &UnitContext) -> Result<u64> {
        let rows = self.count_with_retry(ctx).await?;
        self.snapshot.send_modify(|snap| {
            snap.total_rows = rows;
            snap.remained_rows = rows;
            snap.updated_at = Utc::now();
        });
        self.publish_row_counts();
        self.transition(DeletionStatus::Waiting)?;
        debug!(table = %self.table, rows = rows, "analyzed");
        Ok(rows)
    }

    /// Delete this table's matching rows in bounded batches.
    ///
    /// Returns once `remained_rows` reaches zero; the caller performs the
    /// final transition to Completed.
    pub async fn delete_directly(&self, ctx: &UnitContext) -> Result<()> {
        self.transition(DeletionStatus::Deleting { retry_count: 0 })?;
        info!(table = %self.table, rows = self.snapshot().remained_rows, "deleting rows");

        let mut stalled = 0u32;
        loop {
            let remained = self.snapshot().remained_rows;
            if remained == 0 {
                return Ok(());
            }
            if ctx.cancel.is_cancelled() {
                return Err(TruncateError::Cancelled);
            }

            let affected = self.delete_with_retry(ctx).await?;
            if affected > 0 {
                stalled = 0;
                self.record_remaining(remained.saturating_sub(affected));
                continue;
            }

            // Nothing matched any more: refresh the estimate from the store
            let measured = self.count_with_retry(ctx).await?;
            self.record_remaining(measured.min(remained));
            if measured > 0 {
                stalled += 1;
                if stalled >= MAX_STALLED_BATCHES {
                    return Err(TruncateError::TableFailed {
                        table: self.table.clone(),
                        source: StorageError::permanent(
                            PermanentKind::Other,
                            "delete_batch",
                            &self.table,
                            format!("{measured} matching rows remain but deletes affect none"),
                        ),
                    });
                }
            }
        }
    }

    /// Re-measure a cascade-deleted table until its owners' cascades empty it.
    ///
    /// `owner_state` aggregates every table whose delete can cascade onto this
    /// one. Residue only counts against the owners once all of them are done;
    /// `owners` names them in the resulting error.
    pub async fn await_cascade(
        &self,
        ctx: &UnitContext,
        owners: &str,
        mut owner_state: watch::Receiver<OwnerState>,
    ) -> Result<CascadeExit> {
        let mut unchanged_polls = 0u32;
        let mut previous = self.snapshot().remained_rows;

        loop {
            if previous == 0 {
                return Ok(CascadeExit::Completed);
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(TruncateError::Cancelled),
                _ = tokio::time::sleep(ctx.config.cascade_poll_interval()) => {}
            }

            let measured = self.count_with_retry(ctx).await?;
            let remaining = measured.min(previous);
            self.snapshot.send_modify(|snap| {
                snap.remained_rows = remaining;
                snap.updated_at = Utc::now();
            });
            self.publish_row_counts();
            self.transition(DeletionStatus::CascadeDeleting {
                last_measured_at: Some(Utc::now()),
            })?;
            if remaining == 0 {
                return Ok(CascadeExit::Completed);
            }

            let state = *owner_state.borrow_and_update();
            match state {
                OwnerState::Deleting => unchanged_polls = 0,
                OwnerState::Failed => return Ok(CascadeExit::OwnerFailed),
                OwnerState::Finished if remaining > 0 => {
                    if remaining >= previous {
                        unchanged_polls += 1;
                    } else {
                        unchanged_polls = 0;
                    }
                    if unchanged_polls >= ctx.config.cascade_settle_polls {
                        return Err(TruncateError::CascadeIncomplete {
                            table: self.table.clone(),
                            owner: owners.to_string(),
                            remaining,
                        });
                    }
                }
                OwnerState::Finished => {}
            }
            previous = remaining;
        }
    }

    fn record_remaining(&self, remained: u64) {
        self.snapshot.send_modify(|snap| {
            snap.remained_rows = remained.min(snap.remained_rows);
            if let DeletionStatus::Deleting { retry_count } = &mut snap.status {
                *retry_count = 0;
            }
            snap.updated_at = Utc::now();
        });
        self.publish_row_counts();
    }

    fn publish_row_counts(&self) {
        let snap = self.snapshot();
        self.events.publish(DeletionEvent::RowCountUpdated {
            node: self.node,
            table: self.table.clone(),
            total_rows: snap.total_rows,
            remained_rows: snap.remained_rows,
        });
    }

    fn note_retry(&self, attempts: u32) {
        if let DeletionStatus::Deleting { .. } = self.status() {
            match self.transition(DeletionStatus::Deleting {
                retry_count: attempts,
            }) {
                Ok(()) => {}
                Err(e) => debug!(table = %self.table, error = %e, "retry count not recorded"),
            }
        }
    }

    async fn count_with_retry(&self, ctx: &UnitContext) -> Result<u64> {
        let store = ctx.store.as_ref();
        let table = self.table.as_str();
        let filter: &str = &self.where_clause;
        self.retrying(ctx, &ctx.count_permits, "count_rows", move || {
            store.count_rows(table, filter)
        })
        .await
    }

    async fn delete_with_retry(&self, ctx: &UnitContext) -> Result<u64> {
        let store = ctx.store.as_ref();
        let table = self.table.as_str();
        let filter: &str = &self.where_clause;
        let batch_size = ctx.config.batch_size;
        self.retrying(ctx, &ctx.batch_permits, "delete_batch", move || {
            store.delete_batch(table, filter, batch_size)
        })
        .await
    }

    /// Run `call` under a permit, retrying transient failures with backoff.
    ///
    /// Cancellation is honoured while waiting for a permit or backing off; a
    /// call that already started always runs to completion.
    async fn retrying<F, Fut>(
        &self,
        ctx: &UnitContext,
        permits: &Semaphore,
        operation: &'static str,
        call: F,
    ) -> Result<u64>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<u64>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = {
                let _permit = tokio::select! {
                    permit = permits.acquire() => permit.map_err(|_| TruncateError::Cancelled)?,
                    _ = ctx.cancel.cancelled() => return Err(TruncateError::Cancelled),
                };
                call().await
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(TruncateError::TableFailed {
                    table: self.table.clone(),
                    source: error,
                });
            }
            if !ctx.backoff.should_retry(attempts) {
                return Err(TruncateError::RetryExhausted {
                    table: self.table.clone(),
                    attempts,
                    last_error: error,
                });
            }

            let delay = ctx.backoff.delay_for(attempts);
            warn!(
                table = %self.table,
                operation = operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient storage error, backing off"
            );
            self.note_retry(attempts);

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(TruncateError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
