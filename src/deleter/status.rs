use crate::graph::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-table deletion status.
///
/// Transitions only move forward:
/// `Analyzing -> Waiting -> (Deleting | CascadeDeleting) -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeletionStatus {
    /// Measuring matching rows; nothing is deleted yet
    #[default]
    Analyzing,
    /// Row count known; blocked on dependencies
    Waiting,
    /// Issuing this table's own delete batches
    Deleting { retry_count: u32 },
    /// Rows are removed by an owner's cascade; only re-measured
    CascadeDeleting {
        last_measured_at: Option<DateTime<Utc>>,
    },
    /// Terminal; no matching rows remain
    Completed,
}

impl DeletionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// States in which an execution unit owns the node
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Analyzing | Self::Deleting { .. } | Self::CascadeDeleting { .. }
        )
    }

    pub fn is_deleting(&self) -> bool {
        matches!(self, Self::Deleting { .. } | Self::CascadeDeleting { .. })
    }

    fn phase(&self) -> u8 {
        match self {
            Self::Analyzing => 0,
            Self::Waiting => 1,
            Self::Deleting { .. } | Self::CascadeDeleting { .. } => 2,
            Self::Completed => 3,
        }
    }

    /// Forward-only check. Within the deleting phase a node may refresh its own
    /// variant (retry count, measurement time) but never switch branch.
    pub fn can_transition_to(&self, next: &DeletionStatus) -> bool {
        match (self, next) {
            (Self::Deleting { .. }, Self::Deleting { .. }) => true,
            (Self::CascadeDeleting { .. }, Self::CascadeDeleting { .. }) => true,
            _ => next.phase() == self.phase() + 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Waiting => "waiting",
            Self::Deleting { .. } => "deleting",
            Self::CascadeDeleting { .. } => "cascade_deleting",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleting { retry_count } if *retry_count > 0 => {
                write!(f, "deleting (retry {retry_count})")
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Immutable point-in-time view of one table's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub node: NodeId,
    pub table_name: String,
    pub status: DeletionStatus,
    pub total_rows: u64,
    pub remained_rows: u64,
    /// Set when the node failed permanently
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TableSnapshot {
    pub fn new(node: NodeId, table_name: impl Into<String>) -> Self {
        Self {
            node,
            table_name: table_name.into(),
            status: DeletionStatus::Analyzing,
            total_rows: 0,
            remained_rows: 0,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn deleted_rows(&self) -> u64 {
        self.total_rows.saturating_sub(self.remained_rows)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}
