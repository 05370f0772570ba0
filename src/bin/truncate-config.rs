//! # Truncate Configuration Validator
//!
//! Command-line tool for checking truncation settings and filters before a run.
//! Loads the layered configuration (defaults, optional file, `TRUNCATE__*`
//! environment), validates it and prints the effective values.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use truncate_core::config::TruncateConfig;
use truncate_core::filter::{referenced_columns, validate_filter};

#[derive(Parser)]
#[command(name = "truncate-config")]
#[command(about = "Validate truncation configuration and filters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TRUNCATE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the effective configuration
    Validate,

    /// Print the built-in defaults
    Defaults,

    /// Check that a where clause is bounded and list the columns it filters on
    Filter {
        /// The where clause, e.g. "CreatedAt < '2020-01-01'"
        where_clause: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::Validate) | None => validate(&cli),
        Some(Commands::Defaults) => print_config(&cli, &TruncateConfig::default()),
        Some(Commands::Filter { where_clause }) => check_filter(where_clause),
    };

    match result {
        Ok(()) => {
            info!("Validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            eprintln!("❌ {e}");
            process::exit(1);
        }
    }
}

fn validate(cli: &Cli) -> Result<()> {
    let config = TruncateConfig::load(cli.config.as_deref())?;
    if cli.format != "json" {
        println!("🔧 Validating truncation configuration");
        if let Some(path) = &cli.config {
            println!("Config File: {}", path.display());
        }
        println!();
    }
    print_config(cli, &config)?;
    if cli.format != "json" {
        println!();
        println!("✅ Configuration is valid");
    }
    Ok(())
}

fn print_config(cli: &Cli, config: &TruncateConfig) -> Result<()> {
    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        "table" => {
            let rows = [
                ("batch_size", config.batch_size.to_string()),
                ("max_in_flight_batches", config.max_in_flight_batches.to_string()),
                ("max_concurrent_counts", config.max_concurrent_counts.to_string()),
                ("cascade_poll_interval_ms", config.cascade_poll_interval_ms.to_string()),
                ("cascade_settle_polls", config.cascade_settle_polls.to_string()),
                ("event_channel_capacity", config.event_channel_capacity.to_string()),
                ("retry.max_attempts", config.retry.max_attempts.to_string()),
                ("retry.base_delay_ms", config.retry.base_delay_ms.to_string()),
                ("retry.max_delay_ms", config.retry.max_delay_ms.to_string()),
                ("retry.backoff_multiplier", config.retry.backoff_multiplier.to_string()),
            ];
            for (key, value) in rows {
                println!("  {key:<28} {value}");
            }
        }
        other => bail!("unsupported output format: {other}"),
    }
    Ok(())
}

fn check_filter(where_clause: &str) -> Result<()> {
    validate_filter(where_clause)?;
    let columns = referenced_columns(where_clause);
    println!("✅ Filter is bounded");
    if columns.is_empty() {
        println!("No column references found");
    } else {
        let columns: Vec<String> = columns.into_iter().collect();
        println!("Filtered columns: {}", columns.join(", "));
    }
    Ok(())
}
