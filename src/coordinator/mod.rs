//! # Deletion Coordinator
//!
//! Owns the dependency graph and one [`TableDeleter`] per node, and runs the
//! whole truncation:
//!
//! 1. **Construction** validates the filter, applies include/exclude lists and
//!    builds the graph. Configuration and cycle errors surface here, before
//!    any row is touched.
//! 2. **Analysis** counts matching rows for every table (Analyzing → Waiting).
//! 3. **Scheduling** launches a direct-deletion unit for every node whose
//!    dependencies are satisfied, marks cascaded descendants CascadeDeleting
//!    and polls them, and promotes dependents as nodes complete.
//!
//! Readers never see shared mutable fields: they take [`TableSnapshot`]s or
//! subscribe to the [`DeletionEvent`] stream.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use truncate_core::config::TruncateConfig;
//! use truncate_core::coordinator::Coordinator;
//! use truncate_core::schema::{OnDeleteAction, TableSchema};
//! use truncate_core::storage::InMemoryStore;
//!
//! # async fn example() -> truncate_core::Result<()> {
//! let schemas = vec![
//!     TableSchema::root("Customers"),
//!     TableSchema::interleaved("Orders", "Customers", OnDeleteAction::Cascade),
//! ];
//! let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
//! let coordinator = Coordinator::construct(
//!     schemas,
//!     vec![],
//!     "CreatedAt < '2020-01-01'",
//!     &[],
//!     &[],
//!     store,
//!     TruncateConfig::default(),
//! )?;
//! coordinator.start(CancellationToken::new())?;
//! coordinator.wait_completed().await?;
//! # Ok(())
//! # }
//! ```

mod scheduler;

pub use crate::events::{DeletionEvent, EventPublisher};

use crate::config::TruncateConfig;
use crate::deleter::{DeletionStatus, TableDeleter, TableSnapshot, UnitContext};
use crate::error::{ConfigError, Result, TruncateError};
use crate::filter::{is_filter_indexed, referenced_columns, validate_filter};
use crate::graph::{DependencyGraph, NodeId};
use crate::schema::{filter_table_schemas, IndexSchema, TableSchema};
use crate::storage::TableStore;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use self::scheduler::Scheduler;

/// Final per-table view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Every table, in flattened order
    pub tables: Vec<TableSnapshot>,
    pub failed: Vec<String>,
    /// Tables never scheduled because a dependency failed
    pub blocked: Vec<String>,
}

impl RunReport {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.total_rows).sum()
    }

    pub fn deleted_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.deleted_rows()).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.blocked.is_empty()
            && self.tables.iter().all(|t| t.status.is_terminal())
    }
}

type Outcome = Option<Result<()>>;

pub struct Coordinator {
    run_id: Uuid,
    graph: Arc<DependencyGraph>,
    deleters: Arc<[Arc<TableDeleter>]>,
    store: Arc<dyn TableStore>,
    config: Arc<TruncateConfig>,
    events: EventPublisher,
    blocked: Arc<Mutex<BTreeSet<NodeId>>>,
    started: AtomicBool,
    outcome: Arc<watch::Sender<Outcome>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("run_id", &self.run_id)
            .field("tables", &self.graph.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl Coordinator {
    /// Validate the filter, select tables and build the dependency graph.
    ///
    /// Fails with a configuration or cycle error before any storage call.
    #[instrument(skip_all, fields(tables = schemas.len()))]
    pub fn construct(
        schemas: Vec<TableSchema>,
        indexes: Vec<IndexSchema>,
        where_clause: &str,
        include_tables: &[String],
        exclude_tables: &[String],
        store: Arc<dyn TableStore>,
        config: TruncateConfig,
    ) -> Result<Self> {
        validate_filter(where_clause)?;
        let selected = filter_table_schemas(schemas, include_tables, exclude_tables)?;
        let graph = DependencyGraph::build(selected, indexes)?;
        Self::new(graph, where_clause, store, config)
    }

    /// Create a coordinator over an already built graph; every node starts Analyzing
    pub fn new(
        graph: DependencyGraph,
        where_clause: &str,
        store: Arc<dyn TableStore>,
        config: TruncateConfig,
    ) -> Result<Self> {
        validate_filter(where_clause)?;
        config.validate()?;

        let run_id = Uuid::new_v4();
        let where_clause: Arc<str> = Arc::from(where_clause.trim());
        let events = EventPublisher::new(config.event_channel_capacity);

        warn_unindexed_tables(&graph, &where_clause);

        let deleters: Arc<[Arc<TableDeleter>]> = graph
            .nodes()
            .iter()
            .map(|node| {
                Arc::new(TableDeleter::new(
                    node.id,
                    node.name(),
                    Arc::clone(&where_clause),
                    events.clone(),
                ))
            })
            .collect();

        let (outcome, _) = watch::channel(None);

        info!(run_id = %run_id, tables = graph.len(), "coordinator constructed");
        Ok(Self {
            run_id,
            graph: Arc::new(graph),
            deleters,
            store,
            config: Arc::new(config),
            events,
            blocked: Arc::new(Mutex::new(BTreeSet::new())),
            started: AtomicBool::new(false),
            outcome: Arc::new(outcome),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn config(&self) -> &TruncateConfig {
        &self.config
    }

    /// Nodes in stable depth-first order, for consistent progress output
    pub fn flatten_tables(&self) -> Vec<NodeId> {
        self.graph.flatten_tables()
    }

    /// Subscribe to status and row-count events.
    ///
    /// Subscribe before `start` to observe the whole run.
    pub fn subscribe(&self) -> broadcast::Receiver<DeletionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self, table: &str) -> Option<TableSnapshot> {
        self.graph
            .find(table)
            .map(|id| self.deleters[id.0].snapshot())
    }

    /// Point-in-time snapshots of every table, in flattened order
    pub fn snapshots(&self) -> Vec<TableSnapshot> {
        self.flatten_tables()
            .into_iter()
            .map(|id| self.deleters[id.0].snapshot())
            .collect()
    }

    /// Count matching rows of every table still Analyzing
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn analyze(&self) -> Result<()> {
        let ctx = self.unit_context(CancellationToken::new());
        analyze_nodes(Arc::clone(&self.deleters), ctx).await
    }

    /// Launch the run in the background. Analyses first when needed.
    #[instrument(skip(self, cancel), fields(run_id = %self.run_id))]
    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::invalid_value("coordinator", "run already started").into());
        }

        let ctx = self.unit_context(cancel);
        let deleters = Arc::clone(&self.deleters);
        let scheduler = Scheduler::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.deleters),
            ctx.clone(),
            self.events.clone(),
            Arc::clone(&self.blocked),
        );
        let events = self.events.clone();
        let outcome = Arc::clone(&self.outcome);

        info!(tables = self.graph.len(), "🚀 starting deletion run");
        let span = info_span!("deletion_run", run_id = %self.run_id);
        tokio::spawn(
            async move {
                let result = match analyze_nodes(deleters, ctx).await {
                    Ok(()) => scheduler.run().await,
                    Err(error) => Err(error),
                };
                match &result {
                    Ok(()) => info!("✅ deletion run completed"),
                    Err(error) => error!(error = %error, "deletion run failed"),
                }
                events.publish(DeletionEvent::RunFinished {
                    succeeded: result.is_ok(),
                });
                outcome.send_replace(Some(result));
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Wait until every unit settled; returns the first permanent failure
    pub async fn wait_completed(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ConfigError::invalid_value("coordinator", "run not started").into());
        }
        let mut outcome = self.outcome.subscribe();
        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TruncateError::Cancelled)?;
        settled.clone().unwrap_or(Err(TruncateError::Cancelled))
    }

    pub fn report(&self) -> RunReport {
        let tables = self.snapshots();
        let failed = tables
            .iter()
            .filter(|t| t.is_failed())
            .map(|t| t.table_name.clone())
            .collect();
        let blocked = self
            .blocked
            .lock()
            .iter()
            .map(|id| self.graph.node(*id).name().to_string())
            .collect();
        RunReport {
            run_id: self.run_id,
            tables,
            failed,
            blocked,
        }
    }

    fn unit_context(&self, cancel: CancellationToken) -> UnitContext {
        UnitContext::new(Arc::clone(&self.store), Arc::clone(&self.config), cancel)
    }
}

async fn analyze_nodes(deleters: Arc<[Arc<TableDeleter>]>, ctx: UnitContext) -> Result<()> {
    let pending: Vec<Arc<TableDeleter>> = deleters
        .iter()
        .filter(|d| d.status() == DeletionStatus::Analyzing)
        .cloned()
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    debug!(tables = pending.len(), "analyzing tables");

    let results: Vec<(NodeId, Result<u64>)> = stream::iter(pending)
        .map(|deleter| {
            let ctx = ctx.clone();
            async move {
                let result = deleter.analyze(&ctx).await;
                (deleter.node(), result)
            }
        })
        .buffer_unordered(ctx.config.max_concurrent_counts)
        .collect()
        .await;

    let mut first_error: Option<(NodeId, TruncateError)> = None;
    for (node, result) in results {
        if let Err(error) = result {
            deleters[node.0].mark_failed(&error);
            if first_error.as_ref().map_or(true, |(first, _)| node < *first) {
                first_error = Some((node, error));
            }
        }
    }
    match first_error {
        Some((_, error)) => Err(error),
        None => Ok(()),
    }
}

fn warn_unindexed_tables(graph: &DependencyGraph, where_clause: &str) {
    let columns = referenced_columns(where_clause);
    if columns.is_empty() {
        return;
    }
    for node in graph.nodes() {
        if !is_filter_indexed(node.name(), &node.indexes, &columns) {
            warn!(
                table = %node.name(),
                columns = ?columns,
                "no index leads with a filtered column; deletes will scan the table"
            );
        }
    }
}
