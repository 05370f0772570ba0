//! # Truncation Runner
//!
//! End-to-end flow around the coordinator:
//!
//! fetch schemas → select tables → fetch indexes → construct → analyze →
//! plan → confirm → start → report progress → wait.
//!
//! Nothing is deleted before the caller's [`Confirmation`] accepts the
//! [`DeletionPlan`].

use crate::config::TruncateConfig;
use crate::coordinator::{Coordinator, RunReport};
use crate::error::Result;
use crate::filter::validate_filter;
use crate::progress::{format_number, ProgressReporter};
use crate::schema::filter_table_schemas;
use crate::storage::{SchemaCatalog, TableStore};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    pub where_clause: String,
    /// Restrict the run to these tables; empty selects all
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub config: TruncateConfig,
}

impl RunOptions {
    pub fn new(where_clause: impl Into<String>) -> Self {
        Self {
            where_clause: where_clause.into(),
            ..Default::default()
        }
    }

    pub fn include(mut self, tables: &[&str]) -> Self {
        self.include_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn exclude(mut self, tables: &[&str]) -> Self {
        self.exclude_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_config(mut self, config: TruncateConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTable {
    pub table: String,
    pub rows: u64,
}

/// What a run is about to delete, shown before confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionPlan {
    pub where_clause: String,
    /// Tables with matching rows, in flattened order
    pub tables: Vec<PlannedTable>,
}

impl DeletionPlan {
    fn from_coordinator(coordinator: &Coordinator, where_clause: &str) -> Self {
        let tables = coordinator
            .snapshots()
            .into_iter()
            .filter(|s| s.total_rows > 0)
            .map(|s| PlannedTable {
                table: s.table_name,
                rows: s.total_rows,
            })
            .collect();
        Self {
            where_clause: where_clause.to_string(),
            tables,
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// `"1,234 rows from Orders"` per table
    pub fn lines(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|t| format!("{} rows from {}", format_number(t.rows), t.table))
            .collect()
    }

    pub fn prompt(&self) -> String {
        format!(
            "Rows in these tables matching `{}` will be deleted. Do you want to continue?",
            self.where_clause
        )
    }
}

/// Decides whether a plan may proceed
pub trait Confirmation: Send {
    fn confirm(&mut self, plan: &DeletionPlan) -> bool;
}

/// Accepts every plan; for non-interactive runs
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl Confirmation for AutoConfirm {
    fn confirm(&mut self, _plan: &DeletionPlan) -> bool {
        true
    }
}

/// Line-based `[Y/n]` prompt. Only an exact `Y` accepts; `n` or end of input declines.
#[derive(Debug)]
pub struct PromptConfirmation<R, W> {
    input: R,
    output: W,
}

impl<R, W> PromptConfirmation<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, plan: &DeletionPlan) -> std::io::Result<bool> {
        for line in plan.lines() {
            writeln!(self.output, "{line}")?;
        }
        write!(self.output, "{} [Y/n] ", plan.prompt())?;
        self.output.flush()?;

        let mut answer = String::new();
        loop {
            answer.clear();
            if self.input.read_line(&mut answer)? == 0 {
                return Ok(false);
            }
            match answer.trim_end_matches(['\r', '\n']) {
                "Y" => return Ok(true),
                "n" => return Ok(false),
                _ => {
                    write!(self.output, "Please answer Y or n: ")?;
                    self.output.flush()?;
                }
            }
        }
    }
}

impl<R, W> Confirmation for PromptConfirmation<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn confirm(&mut self, plan: &DeletionPlan) -> bool {
        self.ask(plan).unwrap_or_else(|e| {
            warn!(error = %e, "could not read confirmation; declining");
            false
        })
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// No table has rows matching the filter
    NothingToDelete,
    Declined(DeletionPlan),
    Completed(RunReport),
}

/// Run a complete truncation against `catalog` and `store`
#[instrument(skip_all, fields(where_clause = %options.where_clause))]
pub async fn run(
    catalog: &dyn SchemaCatalog,
    store: Arc<dyn TableStore>,
    options: RunOptions,
    confirmation: &mut dyn Confirmation,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    validate_filter(&options.where_clause)?;
    options.config.validate()?;

    info!("fetching table schemas");
    let schemas = catalog.fetch_table_schemas().await?;
    let schemas = filter_table_schemas(schemas, &options.include_tables, &options.exclude_tables)?;
    let indexes = catalog.fetch_index_schemas().await?;

    let coordinator = Coordinator::construct(
        schemas,
        indexes,
        &options.where_clause,
        &[],
        &[],
        store,
        options.config,
    )?;

    info!("fetching row counts");
    coordinator.analyze().await?;

    let plan = DeletionPlan::from_coordinator(&coordinator, &options.where_clause);
    if plan.is_empty() {
        info!(where_clause = %options.where_clause, "no rows match the filter");
        return Ok(RunOutcome::NothingToDelete);
    }
    for line in plan.lines() {
        info!("{line}");
    }
    if !confirmation.confirm(&plan) {
        info!("deletion declined");
        return Ok(RunOutcome::Declined(plan));
    }

    let reporter = ProgressReporter::new(&coordinator).spawn();
    coordinator.start(cancel)?;
    let result = coordinator.wait_completed().await;
    if let Err(e) = reporter.await {
        warn!(error = %e, "progress reporter stopped unexpectedly");
    }
    result?;

    info!(
        rows = %format_number(plan.total_rows()),
        "all rows matching the filter have been deleted"
    );
    Ok(RunOutcome::Completed(coordinator.report()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> DeletionPlan {
        DeletionPlan {
            where_clause: "Status = 'archived'".into(),
            tables: vec![
                PlannedTable {
                    table: "Customers".into(),
                    rows: 10,
                },
                PlannedTable {
                    table: "Orders".into(),
                    rows: 4_000,
                },
            ],
        }
    }

    #[test]
    fn test_plan_lines() {
        let plan = plan();
        assert_eq!(plan.total_rows(), 4_010);
        assert_eq!(plan.lines(), vec!["10 rows from Customers", "4,000 rows from Orders"]);
    }

    #[test]
    fn test_prompt_requires_exact_answer() {
        let mut output = Vec::new();
        let mut prompt = PromptConfirmation::new("yes\ny\nY\n".as_bytes(), &mut output);
        assert!(prompt.confirm(&plan()));

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("4,000 rows from Orders"));
        assert_eq!(text.matches("Please answer Y or n: ").count(), 2);
    }

    #[test]
    fn test_prompt_declines_on_n_or_eof() {
        let mut declined = PromptConfirmation::new("n\n".as_bytes(), Vec::new());
        assert!(!declined.confirm(&plan()));

        let mut eof = PromptConfirmation::new("".as_bytes(), Vec::new());
        assert!(!eof.confirm(&plan()));
    }
}
