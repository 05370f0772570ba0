//! # Deletion Events
//!
//! The coordinator reports progress as a stream of events instead of letting
//! readers poll shared fields. Presentation layers subscribe and render; the
//! coordinator itself never formats text for humans.

use crate::deleter::DeletionStatus;
use crate::graph::NodeId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeletionEvent {
    StatusChanged {
        node: NodeId,
        table: String,
        from: DeletionStatus,
        to: DeletionStatus,
        at: DateTime<Utc>,
    },
    RowCountUpdated {
        node: NodeId,
        table: String,
        total_rows: u64,
        remained_rows: u64,
    },
    NodeFailed {
        node: NodeId,
        table: String,
        error: String,
    },
    /// A node will not be scheduled because a dependency failed
    NodeBlocked {
        node: NodeId,
        table: String,
        blocked_by: String,
    },
    RunFinished {
        succeeded: bool,
    },
}

impl DeletionEvent {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::StatusChanged { node, .. }
            | Self::RowCountUpdated { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeBlocked { node, .. } => Some(*node),
            Self::RunFinished { .. } => None,
        }
    }
}

/// Broadcast publisher for deletion events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<DeletionEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: DeletionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeletionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
