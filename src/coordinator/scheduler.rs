//! Event-driven scheduling of execution units over the dependency graph.
//!
//! The scheduler is a single task that owns the per-node scheduling state.
//! Units report back over an mpsc channel exactly once; every report
//! re-evaluates only the nodes that could have been unblocked by it, so no
//! side of the run ever polls for readiness.

use crate::deleter::{CascadeExit, DeletionStatus, OwnerState, TableDeleter, UnitContext};
use crate::error::{PermanentKind, Result, StorageError, TruncateError};
use crate::events::{DeletionEvent, EventPublisher};
use crate::graph::{DependencyGraph, NodeId};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    /// Direct unit running
    Deleting,
    /// Rows gone, waiting for dependencies to settle before completing
    Draining,
    /// Cascade unit running
    Cascading,
    Completed,
    Failed,
    Blocked,
    Interrupted,
}

#[derive(Debug)]
enum UnitReport {
    /// A direct unit removed all of its own rows
    Deleted(NodeId),
    /// A cascade unit observed its table emptied
    Settled(NodeId),
    /// A cascade unit stopped because its owner failed
    Abandoned(NodeId),
    Failed(NodeId, TruncateError),
}

pub(crate) struct Scheduler {
    graph: Arc<DependencyGraph>,
    deleters: Arc<[Arc<TableDeleter>]>,
    ctx: UnitContext,
    events: EventPublisher,
    blocked: Arc<Mutex<BTreeSet<NodeId>>>,
    states: Vec<NodeState>,
    /// Directly deleted nodes whose delete cascades onto each node
    launchers: Vec<Vec<NodeId>>,
    /// Aggregated owner progress, one per running cascade unit
    cascade_signals: HashMap<NodeId, watch::Sender<OwnerState>>,
    active_units: usize,
    first_error: Option<TruncateError>,
    halted: bool,
    reports_tx: mpsc::UnboundedSender<UnitReport>,
    reports_rx: mpsc::UnboundedReceiver<UnitReport>,
}

impl Scheduler {
    pub(crate) fn new(
        graph: Arc<DependencyGraph>,
        deleters: Arc<[Arc<TableDeleter>]>,
        ctx: UnitContext,
        events: EventPublisher,
        blocked: Arc<Mutex<BTreeSet<NodeId>>>,
    ) -> Self {
        let len = graph.len();
        let launchers = graph.nodes().iter().map(|n| graph.cascade_launchers(n.id)).collect();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            graph,
            deleters,
            ctx,
            events,
            blocked,
            states: vec![NodeState::Pending; len],
            launchers,
            cascade_signals: HashMap::new(),
            active_units: 0,
            first_error: None,
            halted: false,
            reports_tx,
            reports_rx,
        }
    }

    /// Drive the run until no unit is active, returning the run result
    pub(crate) async fn run(mut self) -> Result<()> {
        let all: Vec<NodeId> = self.graph.nodes().iter().map(|n| n.id).collect();
        self.launch_ready(all);
        self.refresh_cascade_signals();

        while self.active_units > 0 {
            let Some(report) = self.reports_rx.recv().await else {
                break;
            };
            self.active_units -= 1;
            self.handle(report);
            self.refresh_cascade_signals();
        }

        self.finish()
    }

    fn handle(&mut self, report: UnitReport) {
        match report {
            UnitReport::Deleted(node) => {
                self.states[node.0] = NodeState::Draining;
                self.try_complete(node);
            }
            UnitReport::Settled(node) => {
                self.cascade_signals.remove(&node);
                self.states[node.0] = NodeState::Draining;
                self.try_complete(node);
            }
            UnitReport::Abandoned(node) => {
                self.cascade_signals.remove(&node);
                let owner = self.launchers[node.0]
                    .iter()
                    .find(|l| !matches!(self.states[l.0], NodeState::Draining | NodeState::Completed))
                    .map(|l| self.name(*l).to_string());
                self.block(node, owner.unwrap_or_default());
                self.settle_dependents(node);
            }
            UnitReport::Failed(node, TruncateError::Cancelled) => {
                info!(table = %self.name(node), "deletion interrupted by cancellation");
                self.cascade_signals.remove(&node);
                self.states[node.0] = NodeState::Interrupted;
                self.settle_dependents(node);
            }
            UnitReport::Failed(node, error) => {
                self.cascade_signals.remove(&node);
                self.fail(node, error);
            }
        }
    }

    fn fail(&mut self, node: NodeId, error: TruncateError) {
        error!(table = %self.name(node), error = %error, "table deletion failed");
        self.deleters[node.0].mark_failed(&error);
        self.states[node.0] = NodeState::Failed;
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
        self.halted = true;

        // Dependents never start, and neither do the tables they would cascade onto
        let mut unreachable = BTreeSet::new();
        for dependent in self.reverse_closure(node) {
            if self.states[dependent.0] == NodeState::Pending {
                unreachable.insert(dependent);
                unreachable.extend(self.graph.cascade_closure(dependent));
            }
        }
        let failed = self.name(node).to_string();
        for blocked in unreachable {
            if self.states[blocked.0] == NodeState::Pending {
                self.block(blocked, failed.clone());
            }
        }
        self.settle_dependents(node);
    }

    fn block(&mut self, node: NodeId, blocked_by: String) {
        warn!(table = %self.name(node), blocked_by = %blocked_by, "table blocked by failed dependency");
        self.states[node.0] = NodeState::Blocked;
        self.blocked.lock().insert(node);
        self.events.publish(DeletionEvent::NodeBlocked {
            node,
            table: self.name(node).to_string(),
            blocked_by,
        });
    }

    /// Push the combined progress of every launcher to each running cascade unit
    fn refresh_cascade_signals(&mut self) {
        let cascading: Vec<NodeId> = self.cascade_signals.keys().copied().collect();
        let launches_possible = !self.halted && !self.ctx.cancel.is_cancelled();
        let mut next: Vec<(NodeId, OwnerState)> = cascading
            .iter()
            .map(|&node| (node, self.owner_state(node, launches_possible)))
            .collect();

        // Only cascade units left and all of them wait on launchers that can
        // no longer start: release them so the run can settle
        let direct_running = self.states.contains(&NodeState::Deleting);
        if launches_possible
            && !direct_running
            && !next.is_empty()
            && next.iter().all(|(_, state)| *state == OwnerState::Deleting)
        {
            debug!(tables = next.len(), "cascade owners can no longer start");
            next = cascading
                .iter()
                .map(|&node| (node, self.owner_state(node, false)))
                .collect();
        }

        for (node, state) in next {
            if let Some(signal) = self.cascade_signals.get(&node) {
                signal.send_if_modified(|current| std::mem::replace(current, state) != state);
            }
        }
    }

    /// Deleting while any launcher may still delete, then Finished or Failed
    fn owner_state(&self, node: NodeId, launches_possible: bool) -> OwnerState {
        let mut failed = false;
        for launcher in &self.launchers[node.0] {
            match self.states[launcher.0] {
                NodeState::Deleting | NodeState::Cascading => return OwnerState::Deleting,
                NodeState::Pending if launches_possible => return OwnerState::Deleting,
                NodeState::Draining | NodeState::Completed => {}
                NodeState::Pending | NodeState::Failed | NodeState::Blocked | NodeState::Interrupted => {
                    failed = true;
                }
            }
        }
        if failed {
            OwnerState::Failed
        } else {
            OwnerState::Finished
        }
    }

    /// Complete a draining node once every dependency has settled
    fn try_complete(&mut self, node: NodeId) {
        if self.states[node.0] != NodeState::Draining || !self.dependencies_settled(node) {
            return;
        }
        match self.deleters[node.0].transition(DeletionStatus::Completed) {
            Ok(()) => {
                info!(table = %self.name(node), "table completed");
                self.states[node.0] = NodeState::Completed;
                self.settle_dependents(node);
                self.launch_after(node);
            }
            Err(error) => self.fail(node, error),
        }
    }

    fn settle_dependents(&mut self, node: NodeId) {
        let dependents = self.graph.node(node).dependents.clone();
        for dependent in dependents {
            self.try_complete(dependent);
        }
    }

    /// Completed, or a cascaded dependency that is either never completing or
    /// still waiting for another table's cascade to empty it
    fn dependencies_settled(&self, node: NodeId) -> bool {
        self.graph.node(node).dependencies.iter().all(|dep| match self.states[dep.node.0] {
            NodeState::Completed => true,
            NodeState::Failed | NodeState::Blocked | NodeState::Interrupted => dep.cascade,
            NodeState::Cascading | NodeState::Draining => {
                dep.cascade && self.awaits_unstarted_launcher(dep.node)
            }
            _ => false,
        })
    }

    fn awaits_unstarted_launcher(&self, node: NodeId) -> bool {
        std::iter::once(node)
            .chain(self.graph.cascade_closure(node))
            .filter(|n| self.states[n.0] != NodeState::Completed)
            .any(|n| {
                self.launchers[n.0]
                    .iter()
                    .any(|l| self.states[l.0] == NodeState::Pending)
            })
    }

    fn launch_after(&mut self, node: NodeId) {
        let candidates = self.reverse_closure(node);
        self.launch_ready(candidates);
    }

    /// Every node that transitively depends on `node`, in id order
    fn reverse_closure(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = self.graph.node(node).dependents.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.graph.node(next).dependents.iter().copied());
            }
        }
        seen.into_iter().collect()
    }

    fn launch_ready(&mut self, candidates: Vec<NodeId>) {
        if self.halted || self.ctx.cancel.is_cancelled() {
            return;
        }
        for node in candidates {
            if self.states[node.0] == NodeState::Pending
                && !self.graph.node(node).is_cascade_owned()
                && self.dependencies_satisfied(node)
            {
                self.launch(node);
            }
        }
    }

    /// Direct dependencies must be completed; cascade-covered ones only need
    /// to be on their way out with the owner's delete
    fn dependencies_satisfied(&self, node: NodeId) -> bool {
        self.graph.node(node).dependencies.iter().all(|dep| {
            if dep.cascade {
                self.cascade_covered(dep.node)
            } else {
                self.states[dep.node.0] == NodeState::Completed
            }
        })
    }

    fn cascade_covered(&self, node: NodeId) -> bool {
        match self.states[node.0] {
            NodeState::Completed | NodeState::Cascading | NodeState::Draining => true,
            NodeState::Pending => self.dependencies_satisfied(node),
            _ => false,
        }
    }

    fn launch(&mut self, owner: NodeId) {
        let cascaded: Vec<NodeId> = self
            .graph
            .cascade_closure(owner)
            .into_iter()
            .filter(|n| self.states[n.0] == NodeState::Pending)
            .collect();

        for &node in &cascaded {
            let marked = self.deleters[node.0].transition(DeletionStatus::CascadeDeleting {
                last_measured_at: None,
            });
            if let Err(error) = marked {
                // The owner never starts; units already marked see it blocked
                self.fail(node, error);
                return;
            }
            self.states[node.0] = NodeState::Cascading;
            self.spawn_cascade(node);
        }

        debug!(table = %self.name(owner), cascaded = cascaded.len(), "launching table deletion");
        self.states[owner.0] = NodeState::Deleting;
        self.spawn_direct(owner);
    }

    fn spawn_direct(&mut self, node: NodeId) {
        let deleter = Arc::clone(&self.deleters[node.0]);
        let ctx = self.ctx.clone();
        self.spawn_unit(node, async move {
            match deleter.delete_directly(&ctx).await {
                Ok(()) => UnitReport::Deleted(node),
                Err(error) => UnitReport::Failed(node, error),
            }
        });
    }

    fn spawn_cascade(&mut self, node: NodeId) {
        let (signal, owner_state) = watch::channel(OwnerState::Deleting);
        self.cascade_signals.insert(node, signal);

        let deleter = Arc::clone(&self.deleters[node.0]);
        let ctx = self.ctx.clone();
        let owners = self.launchers[node.0]
            .iter()
            .map(|l| self.name(*l))
            .collect::<Vec<_>>()
            .join(", ");
        self.spawn_unit(node, async move {
            match deleter.await_cascade(&ctx, &owners, owner_state).await {
                Ok(CascadeExit::Completed) => UnitReport::Settled(node),
                Ok(CascadeExit::OwnerFailed) => UnitReport::Abandoned(node),
                Err(error) => UnitReport::Failed(node, error),
            }
        });
    }

    fn spawn_unit<F>(&mut self, node: NodeId, unit: F)
    where
        F: Future<Output = UnitReport> + Send + 'static,
    {
        self.active_units += 1;
        let reports = self.reports_tx.clone();
        let table = self.name(node).to_string();
        tokio::spawn(async move {
            let report = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(report) => report,
                Err(_) => UnitReport::Failed(
                    node,
                    TruncateError::TableFailed {
                        table: table.clone(),
                        source: StorageError::permanent(
                            PermanentKind::Other,
                            "execution_unit",
                            &table,
                            "execution unit panicked",
                        ),
                    },
                ),
            };
            // The scheduler outlives every unit it spawned
            let _ = reports.send(report);
        });
    }

    fn finish(self) -> Result<()> {
        if let Some(error) = self.first_error {
            return Err(error);
        }
        let unfinished: Vec<String> = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != NodeState::Completed)
            .map(|(i, _)| self.graph.node(NodeId(i)).name().to_string())
            .collect();
        if unfinished.is_empty() {
            Ok(())
        } else if self.ctx.cancel.is_cancelled() {
            Err(TruncateError::Cancelled)
        } else {
            Err(TruncateError::Stalled { tables: unfinished })
        }
    }

    fn name(&self, node: NodeId) -> &str {
        self.graph.node(node).name()
    }
}
