//! Sampled partition rewrites.
//!
//! A sampled task rewrites one partition as [`SAMPLE_COUNT`] independent
//! shards (one per `sample_id`) into scratch tables, then merges them back
//! over the partition with a single copy job. Each shard is tracked in the
//! ledger under its own task id so an interrupted run only redoes the
//! shards whose results are missing.
//!
//! [`SAMPLE_COUNT`]: crate::query::SAMPLE_COUNT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shredder_types::warehouse::{CopyJobConfig, Job, QueryJobConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::ShredError;
use crate::execution::{run_statement, wait_for_job, ExecutionContext, JobOutcome};
use crate::task::{SampleShard, SampledPlan, Task};
use crate::warehouse::Warehouse;

struct ShardResult {
    sample_id: u8,
    destination: Option<String>,
    outcome: JobOutcome,
}

async fn run_shard(
    client: Arc<dyn Warehouse>,
    ctx: Arc<ExecutionContext>,
    shard: SampleShard,
) -> Result<ShardResult, ShredError> {
    let outcome = wait_for_job(client.as_ref(), &ctx, &shard.task_id, true, || {
        run_statement(client.as_ref(), &shard.statement, ctx.dry_run)
    })
    .await?;
    Ok(ShardResult {
        sample_id: shard.sample_id,
        destination: outcome
            .destination
            .clone()
            .or_else(|| shard.statement.config.destination.clone()),
        outcome,
    })
}

async fn collect_shard_results(
    mut shards: JoinSet<Result<ShardResult, ShredError>>,
) -> Result<Vec<ShardResult>, ShredError> {
    let mut results = Vec::with_capacity(shards.len());
    let mut first_error: Option<ShredError> = None;

    // Drain every dispatched shard so each created job reaches the ledger.
    while let Some(joined) = shards.join_next().await {
        match joined {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(error)) => {
                tracing::error!("Sample shard failed: {error}");
                first_error.get_or_insert(error);
            }
            Err(join_err) => {
                first_error.get_or_insert(ShredError::TaskPanicked(format!(
                    "sample shard panicked: {join_err}"
                )));
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => {
            results.sort_by_key(|r| r.sample_id);
            Ok(results)
        }
    }
}

/// Run every shard of `plan` and merge the results into the partition.
///
/// At most `plan.parallelism` shards run at once. After a shard fails no
/// further shards are dispatched; shards already running finish and keep
/// their ledger entries, and the first failure is returned without a merge. Dry runs
/// estimate the merge with a dry-run scan of the partition, since copy jobs
/// have no dry-run mode.
///
/// The returned job carries the summed bytes of every shard.
///
/// # Errors
///
/// Returns the first shard error, or the warehouse error from the merge.
pub async fn run_sampled(
    client: Arc<dyn Warehouse>,
    ctx: Arc<ExecutionContext>,
    task: &Task,
    plan: &SampledPlan,
) -> Result<Job, ShredError> {
    let semaphore = Arc::new(Semaphore::new(plan.parallelism.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut shards = JoinSet::new();
    for shard in &plan.shards {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| ShredError::TaskPanicked(format!("sampling semaphore closed: {e}")))?;
        if failed.load(Ordering::Acquire) {
            tracing::warn!(
                task_id = %task.task_id,
                sample_id = shard.sample_id,
                "Not dispatching remaining sample shards after a failure"
            );
            break;
        }
        let client = Arc::clone(&client);
        let ctx = Arc::clone(&ctx);
        let failed = Arc::clone(&failed);
        let shard = shard.clone();
        shards.spawn(async move {
            let result = run_shard(client, ctx, shard).await;
            if result.is_err() {
                failed.store(true, Ordering::Release);
            }
            drop(permit);
            result
        });
    }
    let results = collect_shard_results(shards).await?;

    let destinations: Vec<String> = results
        .iter()
        .filter_map(|r| r.destination.clone())
        .collect();
    let tense = if ctx.dry_run { "Would copy" } else { "Copying" };
    tracing::debug!(
        task_id = %task.task_id,
        "{tense} {} sample tables to {}",
        destinations.len(),
        plan.merge_destination
    );

    if ctx.dry_run {
        return Ok(client
            .query(&plan.estimate_sql, &QueryJobConfig::dry_run())
            .await?);
    }

    let mut job = client
        .copy_tables(&destinations, &plan.merge_destination, &CopyJobConfig::default())
        .await?;
    job.total_bytes_processed = Some(
        results
            .iter()
            .filter_map(|r| r.outcome.total_bytes_processed)
            .sum(),
    );
    Ok(job)
}
