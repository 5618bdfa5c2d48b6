//! Run entry point: discovery, planning, audit, dispatch and aggregation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use shredder_state::{load_snapshot, LedgerSnapshot};
use shredder_types::table::TargetWithSources;
use tokio::task::JoinSet;

use crate::audit::{build_records, estimate_source_bytes, write_records};
use crate::client_pool::ClientPool;
use crate::config::types::{ShredConfig, TargetsFile};
use crate::config::validator::{validate_config, validate_targets};
use crate::discovery::{self, TargetDiscovery};
use crate::errors::ShredError;
use crate::execution::{execute_task, ExecutionContext, JobOutcome};
use crate::ledger::Ledgers;
use crate::query::source_condition;
use crate::result::RunSummary;
use crate::rewrite::RewriteRules;
use crate::task::{plan_target, sort_tasks, PlanOptions, Task};
use crate::warehouse::{BigQueryClient, Warehouse};

/// Run against BigQuery with the ledgers and targets named in `config`.
///
/// # Errors
///
/// Configuration errors are returned before any warehouse access. See
/// [`run_with`] for the rest.
pub async fn run_shredder(config: &ShredConfig, targets: &TargetsFile) -> Result<RunSummary, ShredError> {
    validate_config(config)?;
    validate_targets(targets)?;
    let discovery =
        discovery::for_environment(targets, config.environment, &config.pioneer_study_projects)?;

    let first_project = config
        .billing_projects
        .first()
        .ok_or_else(|| ShredError::InvalidConfig(vec!["at least one billing project is required".into()]))?;
    let base = BigQueryClient::new(first_project.as_str()).await?;
    let pool = ClientPool::round_robin(&config.billing_projects, config.parallelism, |project| -> Arc<dyn Warehouse> {
        Arc::new(base.for_project(project))
    })?;
    let ledgers = Ledgers::open(
        config.state_table.as_deref(),
        config.task_table.as_deref(),
        &pool.default_client(),
    )?;

    run_with(config, &discovery, Arc::new(pool), ledgers, &RewriteRules::default()).await
}

fn apply_project_overrides(config: &ShredConfig, pair: TargetWithSources) -> TargetWithSources {
    let target = match &config.target_project {
        Some(project) => pair.target.with_project(project),
        None => pair.target,
    };
    let sources = pair
        .sources
        .into_iter()
        .map(|source| match &config.source_project {
            Some(project) => source.with_project(project),
            None => source,
        })
        .collect();
    TargetWithSources { target, sources }
}

fn check_sampling_tables(
    config: &ShredConfig,
    discovered: &[TargetWithSources],
) -> Result<(), ShredError> {
    let names: HashSet<String> = discovered
        .iter()
        .map(|pair| pair.target.table.dataset_table())
        .collect();
    let missing: Vec<String> = config
        .sampling_tables
        .iter()
        .filter(|t| !names.contains(t.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ShredError::MissingSamplingTables(missing))
    }
}

async fn plan_tasks(
    config: &ShredConfig,
    client: &dyn Warehouse,
    discovered: Vec<TargetWithSources>,
    options: &PlanOptions,
    rules: &RewriteRules,
) -> Result<Vec<Task>, ShredError> {
    let mut tasks = Vec::new();
    for pair in discovered {
        let name = pair.target.table.dataset_table();
        if !config.table_filter.matches(&name) {
            continue;
        }
        let use_sampling = config.is_sampling_table(&name);
        let pair = apply_project_overrides(config, pair);
        tasks.extend(
            plan_target(client, &pair.target, &pair.sources, use_sampling, options, rules).await?,
        );
    }
    Ok(tasks)
}

async fn collect_task_results(
    mut running: JoinSet<(usize, Result<JobOutcome, ShredError>)>,
    task_ids: &[String],
) -> Result<Vec<JobOutcome>, ShredError> {
    let mut outcomes: Vec<Option<JobOutcome>> = vec![None; task_ids.len()];
    let mut failures: Vec<(usize, ShredError)> = Vec::new();
    let mut panics = 0usize;

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((index, Ok(outcome))) => outcomes[index] = Some(outcome),
            Ok((index, Err(error))) => {
                tracing::error!(task_id = %task_ids[index], "Task failed: {error}");
                failures.push((index, error));
            }
            Err(join_err) => {
                tracing::error!("Task panicked: {join_err}");
                panics += 1;
                failures.push((usize::MAX, ShredError::TaskPanicked(join_err.to_string())));
            }
        }
    }

    if failures.is_empty() {
        return Ok(outcomes.into_iter().flatten().collect());
    }
    failures.sort_by_key(|(index, _)| *index);
    let failed = failures.len();
    let first = failures.swap_remove(0).1;
    if panics > 0 {
        tracing::error!(panics, "Some tasks panicked");
    }
    Err(ShredError::TaskFailures {
        failed,
        first: Box::new(first),
    })
}

/// Dispatch `tasks` in order, one checked-out client per task.
///
/// Every dispatched task runs to completion. Outcomes are returned in
/// dispatch order.
///
/// # Errors
///
/// Returns [`ShredError::TaskFailures`] if any task failed.
pub async fn execute_all(
    tasks: Vec<Task>,
    pool: &Arc<ClientPool>,
    ctx: Arc<ExecutionContext>,
) -> Result<Vec<JobOutcome>, ShredError> {
    let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.to_string()).collect();
    let mut running = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let client = pool.checkout().await?;
        let ctx = Arc::clone(&ctx);
        running.spawn(async move {
            let result = execute_task(&task, client.shared(), ctx).await;
            drop(client);
            (index, result)
        });
    }
    collect_task_results(running, &task_ids).await
}

/// Run with an explicit discovery, client pool, ledgers and rewrite rules.
///
/// # Errors
///
/// Returns [`ShredError::InvalidConfig`] or
/// [`ShredError::MissingSamplingTables`] before any task is planned,
/// [`ShredError::NoTasks`] when nothing is selected, ledger and audit
/// errors before execution, and [`ShredError::TaskFailures`] after it.
pub async fn run_with(
    config: &ShredConfig,
    discovery: &dyn TargetDiscovery,
    pool: Arc<ClientPool>,
    ledgers: Ledgers,
    rules: &RewriteRules,
) -> Result<RunSummary, ShredError> {
    validate_config(config)?;
    let start = Instant::now();
    let window = config.window();
    let client = pool.default_client();
    tracing::info!(
        environment = %config.environment,
        dry_run = config.dry_run,
        start_date = %window.start,
        end_date = %window.end,
        parallelism = pool.size(),
        "Starting shredder run"
    );

    let snapshot = match &ledgers.state {
        Some(ledger) => load_snapshot(ledger.as_ref(), window.end, !config.dry_run).await?,
        None => LedgerSnapshot::empty(),
    };

    let discovered = discovery.discover(client.as_ref()).await?;
    check_sampling_tables(config, &discovered)?;

    let options = PlanOptions {
        dry_run: config.dry_run,
        use_dml: config.use_dml,
        priority: config.priority,
        end_date: window.end,
        max_single_dml_bytes: config.max_single_dml_bytes,
        partition_limit: config.partition_limit,
        source_condition: source_condition(&window),
        sampling_parallelism: config.sampling_parallelism,
        temp_dataset: config.temp_dataset.clone(),
    };
    let mut tasks = plan_tasks(config, client.as_ref(), discovered, &options, rules).await?;
    if tasks.is_empty() {
        tracing::error!("No tables selected");
        return Err(ShredError::NoTasks);
    }
    sort_tasks(&mut tasks);
    tracing::info!(tasks = tasks.len(), "Planned tasks");

    if let Some(task_ledger) = ledgers.tasks.as_ref().filter(|_| !config.dry_run) {
        task_ledger.ensure_task_table(true).await?;
        let source_bytes = estimate_source_bytes(
            Arc::clone(&client),
            &tasks,
            &options.source_condition,
            config.parallelism,
        )
        .await?;
        write_records(task_ledger.as_ref(), &build_records(&tasks, &window, &source_bytes))
            .await?;
    }

    let table_ids: Vec<String> = tasks.iter().map(Task::table_id).collect();
    let ctx = Arc::new(ExecutionContext {
        snapshot,
        ledger: ledgers.state.clone(),
        dry_run: config.dry_run,
        window,
    });
    let outcomes = execute_all(tasks, &pool, ctx).await?;

    let mut summary = RunSummary::from_outcomes(
        config.dry_run,
        table_ids.iter().map(String::as_str).zip(outcomes.iter()),
    );
    summary.duration_secs = start.elapsed().as_secs_f64();
    summary.log();
    tracing::info!(
        tasks = summary.tasks,
        duration_secs = summary.duration_secs,
        "Shredder run completed"
    );
    Ok(summary)
}
