//! # Error Types
//!
//! Structured error handling for the deletion coordinator using thiserror.
//!
//! Errors fall into three groups:
//!
//! - [`ConfigError`] and [`TruncateError::Cycle`] are raised while building the
//!   coordinator, before any row is touched.
//! - [`StorageError`] is what the storage collaborator reports; it is either
//!   transient (retried locally with backoff) or permanent.
//! - Run-level failures ([`TruncateError::RetryExhausted`],
//!   [`TruncateError::CascadeIncomplete`], [`TruncateError::Cancelled`], ...)
//!   are surfaced by `Coordinator::wait_completed`.

use thiserror::Error;

/// Transient storage conditions that are worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// Lock contention or an aborted transaction
    Contention,
    /// Store-side resource exhaustion (quota, memory, mutation limits)
    ResourceExhausted,
    /// Store temporarily unreachable
    Unavailable,
    /// Operation exceeded its deadline
    DeadlineExceeded,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Contention => write!(f, "contention"),
            TransientKind::ResourceExhausted => write!(f, "resource exhausted"),
            TransientKind::Unavailable => write!(f, "unavailable"),
            TransientKind::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Storage conditions that will not succeed if retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermanentKind {
    PermissionDenied,
    InvalidFilter,
    NotFound,
    /// The store refused the delete because dependent rows still exist
    ConstraintViolation,
    Other,
}

impl std::fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermanentKind::PermissionDenied => write!(f, "permission denied"),
            PermanentKind::InvalidFilter => write!(f, "invalid filter"),
            PermanentKind::NotFound => write!(f, "not found"),
            PermanentKind::ConstraintViolation => write!(f, "constraint violation"),
            PermanentKind::Other => write!(f, "other"),
        }
    }
}

/// Errors reported by the schema/storage collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("transient storage error ({kind}) during {operation} on `{table}`: {message}")]
    Transient {
        kind: TransientKind,
        operation: String,
        table: String,
        message: String,
    },

    #[error("permanent storage error ({kind}) during {operation} on `{table}`: {message}")]
    Permanent {
        kind: PermanentKind,
        operation: String,
        table: String,
        message: String,
    },
}

impl StorageError {
    /// Create a retryable storage error
    pub fn transient(
        kind: TransientKind,
        operation: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            kind,
            operation: operation.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a non-retryable storage error
    pub fn permanent(
        kind: PermanentKind,
        operation: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Permanent {
            kind,
            operation: operation.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Table the failed operation targeted
    pub fn table(&self) -> &str {
        match self {
            Self::Transient { table, .. } | Self::Permanent { table, .. } => table,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Configuration problems detected before a run starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("filter must not be empty")]
    EmptyFilter,

    #[error("filter `{filter}` matches every row; refusing an unbounded purge")]
    UnboundedFilter { filter: String },

    #[error("table `{table}` is interleaved in `{parent}`, which is not part of the selected tables")]
    UnresolvedParent { table: String, parent: String },

    #[error("table `{table}` does not exist in the schema")]
    UnknownTable { table: String },

    #[error("every requested table is also excluded; nothing selected")]
    EmptySelection,

    #[error("invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to load configuration: {message}")]
    Load { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Top-level error for coordinator construction and runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TruncateError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("deleting from `{table}` failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        table: String,
        attempts: u32,
        last_error: StorageError,
    },

    #[error("deleting from `{table}` failed: {source}")]
    TableFailed { table: String, source: StorageError },

    #[error("cascade from `{owner}` left {remaining} matching rows in `{table}`")]
    CascadeIncomplete {
        table: String,
        owner: String,
        remaining: u64,
    },

    #[error("invalid status transition for `{table}`: {from} -> {to}")]
    InvalidTransition {
        table: String,
        from: String,
        to: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("scheduler stalled with unfinished tables: {}", tables.join(", "))]
    Stalled { tables: Vec<String> },
}

impl TruncateError {
    /// Whether this error was raised before any deletion could run
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Cycle { .. })
    }

    /// Table this error is attributed to, when there is one
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::RetryExhausted { table, .. }
            | Self::TableFailed { table, .. }
            | Self::CascadeIncomplete { table, .. }
            | Self::InvalidTransition { table, .. } => Some(table),
            Self::Storage(e) => Some(e.table()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TruncateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_classification() {
        let transient = StorageError::transient(
            TransientKind::Contention,
            "delete_batch",
            "Orders",
            "aborted",
        );
        let permanent = StorageError::permanent(
            PermanentKind::PermissionDenied,
            "delete_batch",
            "Orders",
            "denied",
        );

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.table(), "Orders");
    }

    #[test]
    fn test_cycle_error_renders_path() {
        let err = TruncateError::Cycle {
            path: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: A -> B -> A");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_retry_exhausted_reports_table() {
        let err = TruncateError::RetryExhausted {
            table: "Singers".into(),
            attempts: 3,
            last_error: StorageError::transient(
                TransientKind::ResourceExhausted,
                "delete_batch",
                "Singers",
                "quota",
            ),
        };
        assert_eq!(err.table(), Some("Singers"));
        assert!(!err.is_configuration());
    }
}
