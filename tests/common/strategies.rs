//! Proptest strategies for random acyclic table graphs with consistent data.
//!
//! Table `i` may hang off one earlier table `j < i`, either as an interleaved
//! child or as a table referencing `j`. On top of that owner edge, a table
//! whose owner edge cascades (or that has none) may reference further earlier
//! tables with `ON DELETE CASCADE`, which produces tables with several cascade
//! owners and tables referenced from several places. Every edge points from a
//! lower to a higher index, which keeps the generated graph acyclic.

use proptest::prelude::*;
use std::sync::Arc;
use truncate_core::{InMemoryStore, OnDeleteAction, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Interleaved,
    References,
}

#[derive(Debug, Clone)]
pub struct TableShape {
    /// `(owner index seed, relation, cascades)`
    pub owner: Option<(usize, Relation, bool)>,
    /// Index seeds of extra cascading references
    pub extra_references: Vec<usize>,
    /// Rows per owner row; unowned tables get one more
    pub rows: usize,
    /// Bit pattern deciding which free rows match the filter
    pub match_bits: u32,
}

#[derive(Debug, Clone)]
pub struct ForestShape {
    pub tables: Vec<TableShape>,
}

pub fn relation_strategy() -> impl Strategy<Value = Relation> {
    prop_oneof![Just(Relation::Interleaved), Just(Relation::References)]
}

pub fn table_shape_strategy() -> impl Strategy<Value = TableShape> {
    (
        prop::option::weighted(0.7, (0usize..64, relation_strategy(), any::<bool>())),
        prop::collection::vec(0usize..64, 0..3),
        0usize..3,
        any::<u32>(),
    )
        .prop_map(|(owner, extra_references, rows, match_bits)| TableShape {
            owner,
            extra_references,
            rows,
            match_bits,
        })
}

pub fn forest_strategy() -> impl Strategy<Value = ForestShape> {
    prop::collection::vec(table_shape_strategy(), 1..8).prop_map(|tables| ForestShape { tables })
}

impl ForestShape {
    pub fn table_name(i: usize) -> String {
        format!("T{i}")
    }

    /// Owner of table `i`, resolved against the tables before it
    pub fn owner_of(&self, i: usize) -> Option<(usize, Relation, bool)> {
        if i == 0 {
            return None;
        }
        self.tables[i]
            .owner
            .map(|(seed, relation, cascade)| (seed % i, relation, cascade))
    }

    /// Earlier tables `i` also references with `ON DELETE CASCADE`.
    ///
    /// Only tables whose rows are already cascade-deleted (or unowned) get
    /// them, so every row of a cascade-owned table stays reachable from the
    /// owners that cascade onto it.
    pub fn extra_references_of(&self, i: usize) -> Vec<usize> {
        if i == 0 {
            return Vec::new();
        }
        let owner = self.owner_of(i);
        if matches!(owner, Some((_, _, false))) {
            return Vec::new();
        }
        let mut targets: Vec<usize> = self.tables[i]
            .extra_references
            .iter()
            .map(|seed| seed % i)
            .filter(|k| owner.map_or(true, |(o, _, _)| o != *k))
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    fn action(cascade: bool) -> OnDeleteAction {
        if cascade {
            OnDeleteAction::Cascade
        } else {
            OnDeleteAction::NoAction
        }
    }

    pub fn schemas(&self) -> Vec<TableSchema> {
        let mut schemas: Vec<TableSchema> = (0..self.tables.len())
            .map(|i| match self.owner_of(i) {
                Some((owner, Relation::Interleaved, cascade)) => TableSchema::interleaved(
                    Self::table_name(i),
                    Self::table_name(owner),
                    Self::action(cascade),
                ),
                _ => TableSchema::root(Self::table_name(i)),
            })
            .collect();

        for i in 0..self.tables.len() {
            if let Some((owner, Relation::References, cascade)) = self.owner_of(i) {
                let referenced = schemas[owner].clone();
                schemas[owner] = referenced.with_reference(Self::table_name(i), Self::action(cascade));
            }
            for target in self.extra_references_of(i) {
                let referenced = schemas[target].clone();
                schemas[target] = referenced.with_reference(Self::table_name(i), OnDeleteAction::Cascade);
            }
        }
        schemas
    }

    /// Build a store whose data respects the declared relationships.
    ///
    /// A row of a cascade-owned table matches exactly when one of the rows it
    /// cascades from matches, so every matching cascaded row disappears with a
    /// deleted owner row. Rows owned through NO ACTION always match when their
    /// owner row matches.
    pub fn populate(&self) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new(self.schemas(), vec![]));
        // (key, matches) per table
        let mut rows: Vec<Vec<(u64, bool)>> = Vec::with_capacity(self.tables.len());

        for (i, table) in self.tables.iter().enumerate() {
            let name = Self::table_name(i);
            let free = |n: usize| table.match_bits & (1 << (n % 32)) != 0;
            let extras = self.extra_references_of(i);

            // Owner row per generated row: (owner key, owner matches)
            let owner_rows: Vec<Option<(u64, bool)>> = match self.owner_of(i) {
                None => vec![None; table.rows + 1],
                Some((owner, _, _)) => rows[owner]
                    .iter()
                    .flat_map(|&owner_row| std::iter::repeat(Some(owner_row)).take(table.rows))
                    .collect(),
            };

            let mut table_rows = Vec::with_capacity(owner_rows.len());
            for (n, owner_row) in owner_rows.into_iter().enumerate() {
                let mut references: Vec<(String, u64)> = Vec::new();
                let mut cascaded_match = false;
                for &target in &extras {
                    let candidates = &rows[target];
                    if candidates.is_empty() {
                        continue;
                    }
                    let seed = table.match_bits as usize >> (target % 16);
                    let (key, matches) = candidates[(seed + n) % candidates.len()];
                    references.push((Self::table_name(target), key));
                    cascaded_match |= matches;
                }

                let owner = self.owner_of(i);
                let matches = match (owner, owner_row) {
                    (Some((_, _, true)), Some((_, owner_matches))) => owner_matches || cascaded_match,
                    (Some((_, _, false)), Some((_, owner_matches))) => owner_matches || free(n),
                    _ if !extras.is_empty() => cascaded_match,
                    _ => free(n),
                };

                let parent = match (owner, owner_row) {
                    (Some((_, Relation::Interleaved, _)), Some((key, _))) => Some(key),
                    _ => None,
                };
                if let (Some((owner, Relation::References, _)), Some((key, _))) = (owner, owner_row) {
                    references.push((Self::table_name(owner), key));
                }

                let references: Vec<(&str, u64)> =
                    references.iter().map(|(t, k)| (t.as_str(), *k)).collect();
                let key = store.insert_row_with_references(&name, parent, &references, matches);
                table_rows.push((key, matches));
            }
            rows.push(table_rows);
        }
        store
    }
}
