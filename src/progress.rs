//! Progress reporting over the coordinator's event stream.
//!
//! The reporter keeps its own per-table view built from events and logs a
//! line through `tracing` whenever a table moves forward. Rendering bars or
//! tables is left to whoever consumes the same stream.

use crate::coordinator::{Coordinator, DeletionEvent};
use crate::deleter::{DeletionStatus, TableSnapshot};
use crate::graph::NodeId;
use std::collections::HashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Render `n` with comma thousands separators, e.g. `1234567` as `1,234,567`
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// One progress line: `Orders (30 / 40) 75%`, or `done` once completed
pub fn format_progress(snapshot: &TableSnapshot) -> String {
    let deleted = match snapshot.status {
        DeletionStatus::Completed => snapshot.total_rows,
        DeletionStatus::Analyzing => 0,
        _ => snapshot.deleted_rows(),
    };
    let suffix = if snapshot.status.is_terminal() {
        "done".to_string()
    } else if snapshot.total_rows == 0 {
        "0%".to_string()
    } else {
        format!("{}%", deleted * 100 / snapshot.total_rows)
    };
    format!(
        "{} ({} / {}) {}",
        snapshot.table_name,
        format_number(deleted),
        format_number(snapshot.total_rows),
        suffix
    )
}

/// Final tallies observed by a reporter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub completed_tables: usize,
    pub failed_tables: usize,
    pub blocked_tables: usize,
    pub succeeded: Option<bool>,
    /// Events dropped because the reporter fell behind
    pub missed_events: u64,
}

pub struct ProgressReporter {
    events: broadcast::Receiver<DeletionEvent>,
    tables: HashMap<NodeId, TableSnapshot>,
    summary: ProgressSummary,
}

impl ProgressReporter {
    /// Subscribe to `coordinator`, seeded with its current snapshots.
    ///
    /// Tables without matching rows are not reported.
    pub fn new(coordinator: &Coordinator) -> Self {
        let events = coordinator.subscribe();
        let tables = coordinator
            .snapshots()
            .into_iter()
            .filter(|s| s.total_rows > 0)
            .map(|s| (s.node, s))
            .collect();
        Self {
            events,
            tables,
            summary: ProgressSummary::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<ProgressSummary> {
        tokio::spawn(self.run())
    }

    /// Consume events until the run finishes or the stream closes
    pub async fn run(mut self) -> ProgressSummary {
        loop {
            match self.events.recv().await {
                Ok(DeletionEvent::RunFinished { succeeded }) => {
                    self.summary.succeeded = Some(succeeded);
                    break;
                }
                Ok(event) => self.apply(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "progress reporter fell behind");
                    self.summary.missed_events += missed;
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.summary
    }

    fn apply(&mut self, event: DeletionEvent) {
        match event {
            DeletionEvent::StatusChanged { node, to, .. } => {
                let Some(table) = self.tables.get_mut(&node) else {
                    return;
                };
                table.status = to;
                if to.is_terminal() {
                    self.summary.completed_tables += 1;
                }
                info!(status = %to, "{}", format_progress(table));
            }
            DeletionEvent::RowCountUpdated {
                node,
                total_rows,
                remained_rows,
                ..
            } => {
                let Some(table) = self.tables.get_mut(&node) else {
                    return;
                };
                let advanced = remained_rows < table.remained_rows;
                table.total_rows = total_rows;
                table.remained_rows = remained_rows;
                if advanced {
                    info!("{}", format_progress(table));
                }
            }
            DeletionEvent::NodeFailed { table, error, .. } => {
                self.summary.failed_tables += 1;
                warn!(table = %table, error = %error, "table failed");
            }
            DeletionEvent::NodeBlocked {
                table, blocked_by, ..
            } => {
                self.summary.blocked_tables += 1;
                debug!(table = %table, blocked_by = %blocked_by, "table blocked");
            }
            DeletionEvent::RunFinished { .. } => {}
        }
    }
}
