//! Job execution and ledger tracking.
//!
//! Every task id moves through the same states for a given end date:
//! unknown, dispatched, then completed, failed or expired. The ledger
//! snapshot taken at the start of the run decides whether a previous job is
//! reused, waited on, or replaced by a new one.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use shredder_state::{LedgerSnapshot, StateLedger};
use shredder_types::state::{DateWindow, LedgerEntry, TaskId};
use shredder_types::table::TableRef;
use shredder_types::warehouse::{Job, JobKind, JobRef};

use crate::errors::ShredError;
use crate::query::Statement;
use crate::sampling;
use crate::task::{Task, TaskPlan};
use crate::warehouse::{split_decorator, Warehouse};

/// Metrics retained from a finished job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub job_id: Option<String>,
    pub total_bytes_processed: Option<u64>,
    pub num_dml_affected_rows: Option<u64>,
    pub destination: Option<String>,
}

impl JobOutcome {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id().map(ToString::to_string),
            total_bytes_processed: job.total_bytes_processed,
            num_dml_affected_rows: match job.kind {
                JobKind::Query => job.num_dml_affected_rows,
                JobKind::Copy => None,
            },
            destination: job.destination.clone(),
        }
    }
}

/// Per-run execution state shared by every task.
pub struct ExecutionContext {
    pub snapshot: LedgerSnapshot,
    /// `None` when state tracking is disabled.
    pub ledger: Option<Arc<dyn StateLedger>>,
    pub dry_run: bool,
    pub window: DateWindow,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("snapshot_entries", &self.snapshot.len())
            .field("ledger", &self.ledger.as_ref().map(|l| l.state_location()))
            .field("dry_run", &self.dry_run)
            .field("window", &self.window)
            .finish()
    }
}

/// Append the job for `task_id` to the ledger, if tracking is enabled.
///
/// # Errors
///
/// Returns [`ShredError::MissingJobReference`] for a real job without a
/// reference, or ledger errors (including rejected inserts).
pub async fn record_state(
    ctx: &ExecutionContext,
    task_id: &TaskId,
    job: &Job,
) -> Result<(), ShredError> {
    let Some(ledger) = &ctx.ledger else {
        return Ok(());
    };
    if ctx.dry_run {
        tracing::info!(
            "Would insert a job_id in {} for task: {task_id}",
            ledger.state_location()
        );
        return Ok(());
    }
    let reference = job
        .reference
        .as_ref()
        .ok_or_else(|| ShredError::MissingJobReference(task_id.clone()))?;
    let job_id = reference.full_id();
    tracing::info!(
        "Inserting {job_id} in {} for task: {task_id}",
        ledger.state_location()
    );
    ledger
        .record_job(&LedgerEntry {
            task_id: task_id.clone(),
            job_id,
            job_created: job.created,
            start_date: ctx.window.start,
            end_date: ctx.window.end,
        })
        .await?;
    Ok(())
}

async fn destination_exists(
    client: &dyn Warehouse,
    destination: Option<&str>,
) -> Result<bool, ShredError> {
    let Some(destination) = destination else {
        return Ok(false);
    };
    let (table_id, _) = split_decorator(destination);
    let table = TableRef::parse(table_id, Some(client.project()))?;
    Ok(client.get_table(&table).await?.is_some())
}

/// Look up the ledger entry for `task_id` and decide whether its job can be
/// reused.
async fn previous_job(
    client: &dyn Warehouse,
    ctx: &ExecutionContext,
    task_id: &TaskId,
    check_table_existence: bool,
) -> Result<Option<Job>, ShredError> {
    let Some(full_id) = ctx.snapshot.get(task_id) else {
        return Ok(None);
    };
    let reference = JobRef::parse_full_id(full_id)?;
    let job = match client.get_job(&reference).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => {
            tracing::info!(task_id = %task_id, "Previous job {full_id} not found, retrying");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if job.has_errors() {
        tracing::info!("Previous attempt failed, retrying for {task_id}");
        return Ok(None);
    }
    if !job.ended {
        tracing::info!("Previous attempt still running for {task_id}");
        return Ok(Some(job));
    }
    if check_table_existence && !destination_exists(client, job.destination.as_deref()).await? {
        tracing::info!("Previous result expired, retrying for {task_id}");
        return Ok(None);
    }
    tracing::info!("Previous attempt succeeded, reusing result for {task_id}");
    Ok(Some(job))
}

/// Reuse the job recorded for `task_id` or create one with `create_job`,
/// then wait for it to finish.
///
/// A newly created job is recorded in the ledger before waiting, so an
/// interrupted run resumes by waiting on the same job. When
/// `check_table_existence` is set, a finished job whose destination table
/// is gone is replaced.
///
/// # Errors
///
/// Returns [`ShredError::JobFailed`] if the job finished with errors, or any
/// warehouse and ledger error encountered along the way.
pub async fn wait_for_job<F, Fut>(
    client: &dyn Warehouse,
    ctx: &ExecutionContext,
    task_id: &TaskId,
    check_table_existence: bool,
    create_job: F,
) -> Result<JobOutcome, ShredError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Job, ShredError>>,
{
    let mut job = match previous_job(client, ctx, task_id, check_table_existence).await? {
        Some(job) => job,
        None => {
            let job = create_job().await?;
            record_state(ctx, task_id, &job).await?;
            job
        }
    };

    if !ctx.dry_run && !job.ended {
        let reference = job
            .reference
            .clone()
            .ok_or_else(|| ShredError::MissingJobReference(task_id.clone()))?;
        tracing::info!("Waiting on {reference} for {task_id}");
        let finished = client.wait_job(&reference).await?;
        let bytes = job.total_bytes_processed;
        job = finished;
        if job.total_bytes_processed.is_none() {
            job.total_bytes_processed = bytes;
        }
    }

    if job.has_errors() {
        return Err(ShredError::JobFailed {
            task_id: task_id.clone(),
            job_id: job
                .reference
                .as_ref()
                .map_or_else(|| "dry run".to_string(), JobRef::full_id),
            errors: job.errors,
        });
    }
    Ok(JobOutcome::from_job(&job))
}

/// Start the job for a single statement.
///
/// # Errors
///
/// Returns the warehouse error if the job can't be created.
pub async fn run_statement(
    client: &dyn Warehouse,
    statement: &Statement,
    dry_run: bool,
) -> Result<Job, ShredError> {
    let tense = if dry_run { "Would run" } else { "Running" };
    tracing::debug!(billing_project = client.project(), "{tense} query: {}", statement.sql);
    Ok(client.query(&statement.sql, &statement.config).await?)
}

/// Execute or resume one task.
///
/// # Errors
///
/// Returns the first error from the task's job (or any of its shards).
pub async fn execute_task(
    task: &Task,
    client: Arc<dyn Warehouse>,
    ctx: Arc<ExecutionContext>,
) -> Result<JobOutcome, ShredError> {
    match &task.plan {
        TaskPlan::Single(statement) => {
            wait_for_job(client.as_ref(), &ctx, &task.task_id, false, || {
                run_statement(client.as_ref(), statement, ctx.dry_run)
            })
            .await
        }
        TaskPlan::Sampled(plan) => {
            wait_for_job(client.as_ref(), &ctx, &task.task_id, false, || {
                sampling::run_sampled(Arc::clone(&client), Arc::clone(&ctx), task, plan)
            })
            .await
        }
    }
}
