use anyhow::{Context, Result};
use chrono::Utc;
use shredder_engine::config::types::{default_start_date, ShredConfig, TableFilter};
use shredder_engine::config::{parser, validator};
use shredder_engine::{run_shredder, RunSummary};

use crate::Cli;

/// Translate command-line flags into run options.
pub fn build_config(cli: &Cli) -> Result<ShredConfig> {
    let end_date = cli.end_date.unwrap_or_else(|| Utc::now().date_naive());
    let mut config = ShredConfig::new(end_date);
    config.environment = cli.environment;
    config.dry_run = cli.dry_run;
    config.use_dml = !cli.no_use_dml;
    config.parallelism = cli.parallelism;
    config.sampling_parallelism = cli.sampling_parallelism;
    config.start_date = cli.start_date.unwrap_or_else(|| default_start_date(end_date));
    config.billing_projects.clone_from(&cli.billing_projects);
    config.source_project.clone_from(&cli.source_project);
    config.target_project.clone_from(&cli.target_project);
    config.max_single_dml_bytes = cli.max_single_dml_bytes;
    config.priority = cli.priority;
    config.state_table.clone_from(&cli.state_table);
    config.task_table.clone_from(&cli.task_table);
    config.sampling_tables.clone_from(&cli.sampling_tables);
    config.temp_dataset.clone_from(&cli.temp_dataset);
    config.partition_limit = cli.partition_limit;
    config.pioneer_study_projects.clone_from(&cli.pioneer_study_projects);
    config.table_filter = TableFilter::new(&cli.only, &cli.except)?;
    Ok(config)
}

/// Execute a shredder run and print its summary.
pub async fn execute(cli: &Cli) -> Result<()> {
    // 1. Options, validated before anything is read
    let config = build_config(cli)?;
    validator::validate_config(&config)?;

    // 2. Targets
    let targets = parser::parse_targets(&cli.targets_config)?;
    validator::validate_targets(&targets)?;
    tracing::info!(
        environment = %config.environment,
        targets_config = %cli.targets_config.display(),
        start_date = %config.start_date,
        end_date = %config.end_date,
        "Configuration validated"
    );

    // 3. Run
    let summary = run_shredder(&config, &targets)
        .await
        .context("Shredder run failed")?;

    print_summary(&summary);

    // Machine-readable JSON for schedulers
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let verb = if summary.dry_run { "would scan" } else { "scanned" };
    println!(
        "Shredder {} completed: {} task(s) across {} table(s).",
        if summary.dry_run { "dry run" } else { "run" },
        summary.tasks,
        summary.tables.len()
    );
    for table in &summary.tables {
        match table.rows_deleted {
            Some(rows) => println!(
                "  {:<60} {verb} {} bytes, deleted {rows} rows",
                table.table, table.bytes_processed
            ),
            None => println!("  {:<60} {verb} {} bytes", table.table, table.bytes_processed),
        }
    }
    println!("  Total bytes:     {}", summary.bytes_processed);
    if let Some(rows) = summary.rows_deleted {
        println!("  Total rows:      {rows}");
    }
    println!("  Duration:        {:.2}s", summary.duration_secs);
}
