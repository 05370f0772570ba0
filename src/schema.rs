//! # Table and Index Schemas
//!
//! Plain schema records supplied by the catalog collaborator, plus the
//! include/exclude selection applied before the dependency graph is built.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// What happens to dependent rows when a referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnDeleteAction {
    /// Dependent rows are removed together with the referenced row
    Cascade,
    /// The delete is refused while dependent rows exist
    #[default]
    NoAction,
}

impl OnDeleteAction {
    pub fn is_cascade(&self) -> bool {
        matches!(self, Self::Cascade)
    }
}

impl fmt::Display for OnDeleteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cascade => write!(f, "CASCADE"),
            Self::NoAction => write!(f, "NO ACTION"),
        }
    }
}

/// A table that references this one (for example through a foreign key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableReference {
    /// Name of the referencing table
    pub table: String,
    pub on_delete: OnDeleteAction,
}

impl TableReference {
    pub fn new(table: impl Into<String>, on_delete: OnDeleteAction) -> Self {
        Self {
            table: table.into(),
            on_delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Interleaving parent, if this table is nested in another one
    pub parent: Option<String>,
    /// Behaviour of this table's rows when their parent row is deleted
    pub on_delete: OnDeleteAction,
    /// Tables referencing this one
    #[serde(default)]
    pub referenced_by: Vec<TableReference>,
}

impl TableSchema {
    /// A top-level table
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            on_delete: OnDeleteAction::NoAction,
            referenced_by: Vec::new(),
        }
    }

    /// A table interleaved in `parent`
    pub fn interleaved(
        name: impl Into<String>,
        parent: impl Into<String>,
        on_delete: OnDeleteAction,
    ) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent.into()),
            on_delete,
            referenced_by: Vec::new(),
        }
    }

    pub fn with_reference(mut self, table: impl Into<String>, on_delete: OnDeleteAction) -> Self {
        self.referenced_by.push(TableReference::new(table, on_delete));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub table: String,
    /// Indexed columns in key order
    pub columns: Vec<String>,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Restrict `schemas` to the requested tables.
///
/// An empty include list selects every table. Exclusion wins when a table is
/// both included and excluded. The result keeps catalog order.
pub fn filter_table_schemas(
    schemas: Vec<TableSchema>,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<TableSchema>> {
    let known: HashSet<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
    for name in include.iter().chain(exclude) {
        if !known.contains(name.as_str()) {
            return Err(ConfigError::UnknownTable {
                table: name.clone(),
            }
            .into());
        }
    }

    let include: HashSet<&str> = include.iter().map(String::as_str).collect();
    let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();

    for overlap in include.intersection(&exclude) {
        warn!(table = %overlap, "table is both included and excluded; excluding it");
    }

    let selected: Vec<TableSchema> = schemas
        .into_iter()
        .filter(|s| include.is_empty() || include.contains(s.name.as_str()))
        .filter(|s| !exclude.contains(s.name.as_str()))
        .collect();

    if !include.is_empty() && selected.is_empty() {
        return Err(ConfigError::EmptySelection.into());
    }

    debug!(selected = selected.len(), "filtered table schemas");
    Ok(selected)
}
