mod commands;
mod logging;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;
use shredder_engine::config::types::{
    Environment, DEFAULT_BILLING_PROJECT, DEFAULT_MAX_SINGLE_DML_BYTES, DEFAULT_PARALLELISM,
    DEFAULT_SAMPLING_PARALLELISM,
};
use shredder_types::warehouse::Priority;

/// Process deletion requests.
#[derive(Parser, Debug)]
#[command(name = "shredder", version, about = "Process deletion requests")]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Targets file describing each environment's deletion targets
    #[arg(long, default_value = "targets.yaml")]
    targets_config: PathBuf,

    /// Dry run queries and don't write ledgers
    #[arg(long, alias = "dry_run")]
    dry_run: bool,

    /// Environment whose targets are processed (telemetry, pioneer, experiments)
    #[arg(long, default_value = "telemetry")]
    environment: Environment,

    /// Study projects scanned in the pioneer environment
    #[arg(long, alias = "pioneer_study_projects", num_args = 1.., value_delimiter = ',')]
    pioneer_study_projects: Vec<String>,

    /// Only process the N most recent partitions per table; requires --dry-run
    #[arg(long, alias = "partition_limit")]
    partition_limit: Option<usize>,

    /// Rewrite partitions with a query instead of deleting with DML
    #[arg(long, alias = "no_use_dml")]
    no_use_dml: bool,

    /// Maximum number of queries to run concurrently
    #[arg(long, short = 'p', default_value_t = DEFAULT_PARALLELISM)]
    parallelism: usize,

    /// First date of deletion requests to process (default: end date minus 14 days)
    #[arg(long, alias = "start_date")]
    start_date: Option<NaiveDate>,

    /// Last date (exclusive) of deletion requests to process (default: today, UTC)
    #[arg(long, alias = "end_date")]
    end_date: Option<NaiveDate>,

    /// Projects to bill queries to, assigned to workers round-robin
    #[arg(
        long,
        alias = "billing_projects",
        num_args = 1..,
        value_delimiter = ',',
        default_value = DEFAULT_BILLING_PROJECT
    )]
    billing_projects: Vec<String>,

    /// Override the project of every source table
    #[arg(long, alias = "source_project")]
    source_project: Option<String>,

    /// Override the project of every target table
    #[arg(long, alias = "target_project")]
    target_project: Option<String>,

    /// Tables larger than this are processed one partition at a time
    #[arg(long, alias = "max_single_dml_bytes", default_value_t = DEFAULT_MAX_SINGLE_DML_BYTES)]
    max_single_dml_bytes: u64,

    /// Priority for query jobs (INTERACTIVE or BATCH)
    #[arg(long, default_value = "INTERACTIVE")]
    priority: Priority,

    /// Job ledger: project.dataset.table or sqlite:<path>
    #[arg(long, alias = "state_table")]
    state_table: Option<String>,

    /// Task audit ledger: project.dataset.table or sqlite:<path>
    #[arg(long, alias = "task_table")]
    task_table: Option<String>,

    /// Tables (dataset.table) processed one sample id at a time
    #[arg(long, alias = "sampling_tables", num_args = 1.., value_delimiter = ',')]
    sampling_tables: Vec<String>,

    /// Concurrent shard queries per sampled partition
    #[arg(long, alias = "sampling_parallelism", default_value_t = DEFAULT_SAMPLING_PARALLELISM)]
    sampling_parallelism: usize,

    /// Dataset (project.dataset) for intermediate sampled results; required with --sampling-tables
    #[arg(long, alias = "temp_dataset")]
    temp_dataset: Option<String>,

    /// Only process tables (dataset.table) matching these globs
    #[arg(long, num_args = 1..)]
    only: Vec<String>,

    /// Skip tables (dataset.table) matching these globs
    #[arg(long, num_args = 1..)]
    except: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    commands::run::execute(&cli).await
}
