//! In-process storage implementation.
//!
//! `InMemoryStore` keeps rows per table and applies the same referential rules a
//! relational store would: deleting a row whose interleaved children or
//! referencing rows are declared `NO ACTION` fails with a constraint violation,
//! while `CASCADE` dependents are removed together with it. The where clause is
//! opaque here too; each row carries a flag saying whether it matches the
//! run's filter.
//!
//! Faults can be injected per table and every delete call is recorded, which
//! makes the store suitable for dry runs and for exercising the coordinator.

use super::{SchemaCatalog, TableStore};
use crate::error::{PermanentKind, StorageError, StorageResult};
use crate::schema::{IndexSchema, TableSchema};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRow {
    pub key: u64,
    /// Key of the parent row for interleaved tables
    pub parent: Option<u64>,
    /// `(referenced table, referenced key)` pairs
    pub references: Vec<(String, u64)>,
    /// Whether the row satisfies the filter
    pub matches: bool,
}

/// One recorded `delete_batch` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCall {
    pub table: String,
    pub affected: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    schemas: Vec<TableSchema>,
    indexes: Vec<IndexSchema>,
    rows: HashMap<String, Vec<MemoryRow>>,
    delete_faults: HashMap<String, VecDeque<StorageError>>,
    count_faults: HashMap<String, VecDeque<StorageError>>,
    sticky_delete_faults: HashMap<String, StorageError>,
    delete_log: Vec<DeleteCall>,
    next_key: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    in_flight_deletes: AtomicUsize,
    peak_in_flight_deletes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new(schemas: Vec<TableSchema>, indexes: Vec<IndexSchema>) -> Self {
        let rows = schemas
            .iter()
            .map(|s| (s.name.clone(), Vec::new()))
            .collect();
        Self {
            state: Mutex::new(MemoryState {
                schemas,
                indexes,
                rows,
                next_key: 1,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Delay every storage call, so concurrent calls actually overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert a row, returning its key
    pub fn insert_row(&self, table: &str, parent: Option<u64>, matches: bool) -> u64 {
        self.insert_row_with_references(table, parent, &[], matches)
    }

    pub fn insert_row_with_references(
        &self,
        table: &str,
        parent: Option<u64>,
        references: &[(&str, u64)],
        matches: bool,
    ) -> u64 {
        let mut state = self.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.rows.entry(table.to_string()).or_default().push(MemoryRow {
            key,
            parent,
            references: references
                .iter()
                .map(|(t, k)| (t.to_string(), *k))
                .collect(),
            matches,
        });
        key
    }

    /// Insert `count` rows sharing the same parent
    pub fn insert_rows(&self, table: &str, count: usize, parent: Option<u64>, matches: bool) -> Vec<u64> {
        (0..count)
            .map(|_| self.insert_row(table, parent, matches))
            .collect()
    }

    /// Queue errors returned by the next `delete_batch` calls on `table`
    pub fn inject_delete_faults(&self, table: &str, faults: impl IntoIterator<Item = StorageError>) {
        self.state
            .lock()
            .delete_faults
            .entry(table.to_string())
            .or_default()
            .extend(faults);
    }

    /// Queue errors returned by the next `count_rows` calls on `table`
    pub fn inject_count_faults(&self, table: &str, faults: impl IntoIterator<Item = StorageError>) {
        self.state
            .lock()
            .count_faults
            .entry(table.to_string())
            .or_default()
            .extend(faults);
    }

    /// Fail every `delete_batch` call on `table` with `fault`
    pub fn fail_deletes(&self, table: &str, fault: StorageError) {
        self.state
            .lock()
            .sticky_delete_faults
            .insert(table.to_string(), fault);
    }

    pub fn matching_rows(&self, table: &str) -> u64 {
        self.state
            .lock()
            .rows
            .get(table)
            .map(|rows| rows.iter().filter(|r| r.matches).count() as u64)
            .unwrap_or(0)
    }

    pub fn total_rows(&self, table: &str) -> u64 {
        self.state
            .lock()
            .rows
            .get(table)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0)
    }

    pub fn delete_log(&self) -> Vec<DeleteCall> {
        self.state.lock().delete_log.clone()
    }

    /// Number of `delete_batch` calls issued against `table`, failed ones included
    pub fn delete_calls(&self, table: &str) -> usize {
        self.state
            .lock()
            .delete_log
            .iter()
            .filter(|call| call.table == table)
            .count()
    }

    /// Rows actually removed by direct delete calls across all tables
    pub fn rows_deleted_directly(&self) -> u64 {
        self.state.lock().delete_log.iter().map(|c| c.affected).sum()
    }

    /// Highest number of delete calls observed running at the same time
    pub fn peak_concurrent_deletes(&self) -> usize {
        self.peak_in_flight_deletes.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MemoryState {
    fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.iter().find(|s| s.name == table)
    }

    fn ensure_table(&self, operation: &str, table: &str) -> StorageResult<()> {
        if self.rows.contains_key(table) {
            Ok(())
        } else {
            Err(StorageError::permanent(
                PermanentKind::NotFound,
                operation,
                table,
                "table not found",
            ))
        }
    }

    /// Collect `(table, key)` plus everything its deletion cascades to
    fn collect_deletion(
        &self,
        table: &str,
        key: u64,
        doomed: &mut HashSet<(String, u64)>,
    ) -> StorageResult<()> {
        if !doomed.insert((table.to_string(), key)) {
            return Ok(());
        }

        for child in self.schemas.iter().filter(|s| s.parent.as_deref() == Some(table)) {
            let children = self.rows.get(&child.name).into_iter().flatten();
            for row in children.filter(|r| r.parent == Some(key)) {
                if child.on_delete.is_cascade() {
                    self.collect_deletion(&child.name, row.key, doomed)?;
                } else if !doomed.contains(&(child.name.clone(), row.key)) {
                    return Err(StorageError::permanent(
                        PermanentKind::ConstraintViolation,
                        "delete_batch",
                        table,
                        format!("row {key} still has interleaved rows in `{}`", child.name),
                    ));
                }
            }
        }

        let references = self
            .schema(table)
            .map(|s| s.referenced_by.as_slice())
            .unwrap_or_default();
        for reference in references {
            let referencing = self.rows.get(&reference.table).into_iter().flatten();
            for row in referencing.filter(|r| r.references.iter().any(|(t, k)| t == table && *k == key)) {
                if reference.on_delete.is_cascade() {
                    self.collect_deletion(&reference.table, row.key, doomed)?;
                } else if !doomed.contains(&(reference.table.clone(), row.key)) {
                    return Err(StorageError::permanent(
                        PermanentKind::ConstraintViolation,
                        "delete_batch",
                        table,
                        format!("row {key} is still referenced from `{}`", reference.table),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl SchemaCatalog for InMemoryStore {
    async fn fetch_table_schemas(&self) -> StorageResult<Vec<TableSchema>> {
        Ok(self.state.lock().schemas.clone())
    }

    async fn fetch_index_schemas(&self) -> StorageResult<Vec<IndexSchema>> {
        Ok(self.state.lock().indexes.clone())
    }
}

#[async_trait]
impl TableStore for InMemoryStore {
    async fn count_rows(&self, table: &str, _where_clause: &str) -> StorageResult<u64> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.ensure_table("count_rows", table)?;
        if let Some(fault) = state.count_faults.get_mut(table).and_then(VecDeque::pop_front) {
            return Err(fault);
        }

        Ok(state.rows[table].iter().filter(|r| r.matches).count() as u64)
    }

    async fn delete_batch(
        &self,
        table: &str,
        _where_clause: &str,
        batch_size_hint: u64,
    ) -> StorageResult<u64> {
        let in_flight = self.in_flight_deletes.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight_deletes.fetch_max(in_flight, Ordering::SeqCst);

        self.simulate_latency().await;
        let result = {
            let mut state = self.state.lock();
            let result = delete_locked(&mut state, table, batch_size_hint);
            state.delete_log.push(DeleteCall {
                table: table.to_string(),
                affected: *result.as_ref().unwrap_or(&0),
            });
            result
        };

        self.in_flight_deletes.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn delete_locked(state: &mut MemoryState, table: &str, batch_size_hint: u64) -> StorageResult<u64> {
    state.ensure_table("delete_batch", table)?;
    if let Some(fault) = state.sticky_delete_faults.get(table) {
        return Err(fault.clone());
    }
    if let Some(fault) = state.delete_faults.get_mut(table).and_then(VecDeque::pop_front) {
        return Err(fault);
    }

    let targets: Vec<u64> = state.rows[table]
        .iter()
        .filter(|r| r.matches)
        .take(batch_size_hint as usize)
        .map(|r| r.key)
        .collect();

    let mut doomed = HashSet::new();
    for key in &targets {
        state.collect_deletion(table, *key, &mut doomed)?;
    }

    for rows_table in state.rows.keys().cloned().collect::<Vec<_>>() {
        if let Some(rows) = state.rows.get_mut(&rows_table) {
            rows.retain(|r| !doomed.contains(&(rows_table.clone(), r.key)));
        }
    }

    Ok(targets.len() as u64)
}
