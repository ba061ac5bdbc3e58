//! CLI argument definitions for statflow.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `backfill` | Run a full historical collection for a dataset |
//! | `update` | Run an incremental update over recent years |
//! | `status` | Show recent runs or one run by id |
//! | `freshness` | Show a dataset's freshness summary |
//! | `sentinels` | Select, check, or sync sentinel series |
//! | `catalog` | Import or list catalog entries |
//! | `usage` | Show per-minute API usage for a provider |

use clap::{Args, Parser, Subcommand, ValueEnum};
use statflow_core::Granularity;

/// Rate-limited collector for statistical-agency time series.
///
/// Ingests BEA/BLS-style datasets into a local DuckDB warehouse without
/// exceeding provider quotas, and detects upstream releases cheaply via
/// sentinel sampling.
#[derive(Debug, Parser)]
#[command(name = "statflow", author, version, about)]
pub struct Cli {
    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Reporting frequency selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Frequency {
    /// Annual values.
    Annual,
    /// Quarterly values.
    Quarterly,
    /// Monthly values.
    Monthly,
}

impl From<Frequency> for Granularity {
    fn from(frequency: Frequency) -> Self {
        match frequency {
            Frequency::Annual => Self::Annual,
            Frequency::Quarterly => Self::Quarterly,
            Frequency::Monthly => Self::Monthly,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a full historical collection for a dataset.
    ///
    /// Walks every catalog entry supporting the chosen frequency, fetching
    /// and upserting observations. The command blocks until the run reaches
    /// a terminal status.
    Backfill(CollectArgs),

    /// Run an incremental update covering recent years only.
    Update(CollectArgs),

    /// Show recent runs for a dataset, or one run by id.
    Status(StatusArgs),

    /// Show a dataset's freshness summary.
    Freshness(DatasetArgs),

    /// Manage sentinel series for freshness detection.
    #[command(subcommand)]
    Sentinels(SentinelsCommand),

    /// Manage the dataset catalog.
    #[command(subcommand)]
    Catalog(CatalogCommand),

    /// Show per-minute API usage recorded for a provider.
    Usage(UsageArgs),
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Dataset to collect (e.g. nipa, regional).
    pub dataset: String,

    /// Upstream provider serving this dataset.
    #[arg(long, default_value = "bea")]
    pub provider: String,

    /// Reporting frequency to collect.
    #[arg(long, value_enum, default_value_t = Frequency::Annual)]
    pub frequency: Frequency,

    /// First year of the window (backfill only; defaults to 1990).
    #[arg(long)]
    pub start_year: Option<i32>,

    /// Last year of the window (backfill only; defaults to the current year).
    #[arg(long)]
    pub end_year: Option<i32>,

    /// Collect only these entry ids instead of the whole catalog.
    #[arg(long, value_delimiter = ',')]
    pub entries: Option<Vec<String>>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Dataset whose recent runs to list.
    pub dataset: Option<String>,

    /// Show one run by id instead.
    #[arg(long)]
    pub run: Option<String>,

    /// Number of recent runs to list.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct DatasetArgs {
    pub dataset: String,
}

#[derive(Debug, Subcommand)]
pub enum SentinelsCommand {
    /// Choose a fresh stratified sentinel sample and seed baselines.
    Select(SentinelSelectArgs),
    /// Check stored sentinels against the provider and update freshness.
    Check(SentinelCheckArgs),
    /// Re-baseline sentinels from freshly collected local data.
    Sync(DatasetArgs),
    /// List stored sentinels.
    List(DatasetArgs),
}

#[derive(Debug, Args)]
pub struct SentinelSelectArgs {
    pub dataset: String,

    /// Upstream provider serving this dataset.
    #[arg(long, default_value = "bea")]
    pub provider: String,

    /// Fraction of the catalog to sample.
    #[arg(long, default_value_t = 0.07)]
    pub fraction: f64,

    /// Minimum sentinel count.
    #[arg(long, default_value_t = 5)]
    pub min: usize,

    /// Maximum sentinel count.
    #[arg(long, default_value_t = 100)]
    pub max: usize,
}

#[derive(Debug, Args)]
pub struct SentinelCheckArgs {
    pub dataset: String,

    /// Upstream provider serving this dataset.
    #[arg(long, default_value = "bea")]
    pub provider: String,
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    /// Import catalog entries from a JSON file.
    Import(CatalogImportArgs),
    /// List catalog entries for a dataset.
    List(DatasetArgs),
}

#[derive(Debug, Args)]
pub struct CatalogImportArgs {
    /// Path to a JSON array of catalog entries.
    pub file: std::path::PathBuf,
}

#[derive(Debug, Args)]
pub struct UsageArgs {
    /// Provider whose ledger to summarize.
    pub provider: String,

    /// Number of most recent minute buckets to show.
    #[arg(long, default_value_t = 30)]
    pub limit: usize,
}
