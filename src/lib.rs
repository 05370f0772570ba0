#![allow(clippy::doc_markdown)] // Allow technical terms like TableStore, NoAction in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Truncate Core Rust
//!
//! Removes every row matching a filter from all tables of a relational store
//! whose tables are nested through interleaving and linked by cascading
//! references, running independent deletions concurrently.
//!
//! ## Overview
//!
//! The tables form a dependency forest: a parent can only be emptied once its
//! interleaved children are, and a referenced table only once the tables
//! referencing it are. Where a relationship declares `ON DELETE CASCADE` the
//! dependent table is never deleted directly; the owner's delete removes its
//! rows and the dependent is only re-measured until it is empty.
//!
//! ## Architecture
//!
//! - [`graph`] - dependency arena built from the selected schemas, with cycle detection
//! - [`deleter`] - per-table state machine (`Analyzing → Waiting → Deleting | CascadeDeleting → Completed`)
//! - [`coordinator`] - owns the graph and schedules execution units as dependencies complete
//! - [`storage`] - the schema catalog and row-store traits, plus an in-memory implementation
//! - [`runner`] - the complete flow with plan confirmation and progress reporting
//!
//! ## Key Features
//!
//! - **Dependency-ordered deletion**: a table deletes only after everything depending on it is empty
//! - **Bounded fan-out**: delete batches in flight are capped across the whole forest
//! - **Retry with backoff**: transient storage errors retry locally, permanent ones fail the table
//! - **Failure isolation**: unrelated tables finish, dependents of a failure are reported blocked
//! - **Event stream**: progress is published as events, never formatted by the core
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use truncate_core::runner::{run, AutoConfirm, RunOptions, RunOutcome};
//! use truncate_core::schema::{OnDeleteAction, TableSchema};
//! use truncate_core::storage::InMemoryStore;
//!
//! # async fn example() -> truncate_core::Result<()> {
//! let store = Arc::new(InMemoryStore::new(
//!     vec![
//!         TableSchema::root("Customers"),
//!         TableSchema::interleaved("Orders", "Customers", OnDeleteAction::Cascade),
//!     ],
//!     vec![],
//! ));
//!
//! let outcome = run(
//!     store.as_ref(),
//!     store.clone(),
//!     RunOptions::new("CreatedAt < '2020-01-01'"),
//!     &mut AutoConfirm,
//!     CancellationToken::new(),
//! )
//! .await?;
//!
//! if let RunOutcome::Completed(report) = outcome {
//!     println!("deleted {} rows", report.deleted_rows());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and property tests
//! ```

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod deleter;
pub mod error;
pub mod events;
pub mod filter;
pub mod graph;
pub mod logging;
pub mod progress;
pub mod runner;
pub mod schema;
pub mod storage;

pub use config::{RetryConfig, TruncateConfig};
pub use coordinator::{Coordinator, RunReport};
pub use deleter::{DeletionStatus, TableSnapshot};
pub use error::{ConfigError, Result, StorageError, TruncateError};
pub use events::{DeletionEvent, EventPublisher};
pub use graph::{DependencyGraph, NodeId};
pub use schema::{IndexSchema, OnDeleteAction, TableSchema};
pub use storage::{InMemoryStore, SchemaCatalog, TableStore};
