//! # Storage Collaborator Interfaces
//!
//! The coordinator never talks to a database directly. Schema introspection and
//! the count/delete primitives are supplied through these traits, which keeps
//! all storage I/O opaque to the core.
//!
//! - [`SchemaCatalog`] - table and index introspection
//! - [`TableStore`] - filtered row counts and bounded delete batches
//! - [`memory::InMemoryStore`] - in-process implementation of both, enforcing
//!   interleaving and foreign-key semantics

pub mod memory;

use crate::error::StorageResult;
use crate::schema::{IndexSchema, TableSchema};
use async_trait::async_trait;

pub use memory::{InMemoryStore, MemoryRow};

/// Supplies the schema the dependency graph is built from
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn fetch_table_schemas(&self) -> StorageResult<Vec<TableSchema>>;

    async fn fetch_index_schemas(&self) -> StorageResult<Vec<IndexSchema>>;
}

/// Row-level primitives the deleters drive
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Number of rows in `table` matching `where_clause`
    async fn count_rows(&self, table: &str, where_clause: &str) -> StorageResult<u64>;

    /// Delete up to roughly `batch_size_hint` matching rows, returning the affected count
    ///
    /// Rows removed through cascades are not included in the returned count.
    async fn delete_batch(
        &self,
        table: &str,
        where_clause: &str,
        batch_size_hint: u64,
    ) -> StorageResult<u64>;
}
