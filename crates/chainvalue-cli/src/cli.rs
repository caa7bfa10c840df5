//! CLI argument definitions for chainvalue.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Value one entity from a fixture file and persist the snapshot |
//! | `history` | List stored snapshots of an entity |
//! | `failures` | List recorded failed runs of an entity |
//!
//! # Examples
//!
//! ```bash
//! chainvalue run demos/ledgity.json --pretty
//! chainvalue run demos/ledgity.json --config engine.json --max-retries 5
//! chainvalue history ledgity --partition polygon
//! RUST_LOG=chainvalue_core=debug chainvalue run demos/ledgity.json --in-memory
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "chainvalue",
    author,
    version,
    about = "Multi-chain value aggregation with validated fallback recovery"
)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// DuckDB file holding snapshots. Defaults to `$CHAINVALUE_HOME/snapshots.duckdb`.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Value one entity from a fixture file.
    Run(RunArgs),
    /// List stored snapshots of an entity.
    History(HistoryArgs),
    /// List recorded failed runs of an entity.
    Failures(FailuresArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON fixture describing the entity, balances, prices and oracle readings.
    pub fixture: PathBuf,

    /// JSON engine configuration. Missing fields take their defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Keep snapshots in memory only; history starts empty.
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,

    /// Total attempts per partition.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Maximum age in seconds of a fallback value.
    #[arg(long)]
    pub staleness_limit_seconds: Option<u64>,

    /// Maximum share of the total a fallback may represent.
    #[arg(long)]
    pub materiality_limit: Option<f64>,

    /// Succeed with immaterial partitions left out.
    #[arg(long, default_value_t = false)]
    pub tolerate_omissions: bool,

    #[arg(long)]
    pub timeout_per_attempt_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    pub entity: String,

    /// Show one partition's value series instead of whole snapshots.
    #[arg(long)]
    pub partition: Option<String>,
}

#[derive(Debug, Args)]
pub struct FailuresArgs {
    pub entity: String,
}
