//! Task audit rows.
//!
//! Before execution each planned task gets one audit row carrying the
//! target's size and a dry-run estimate of the bytes its sources will scan.

use std::collections::HashMap;
use std::sync::Arc;

use shredder_state::TaskLedger;
use shredder_types::state::{DateWindow, TaskRecord};
use shredder_types::table::DeleteSource;
use shredder_types::warehouse::QueryJobConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::ShredError;
use crate::task::Task;
use crate::warehouse::Warehouse;

/// Maximum rows per streaming insert.
pub const INSERT_BATCH_SIZE: usize = 10_000;

/// Dry-run query scanning one source for the run's date window.
#[must_use]
pub fn source_scan_sql(source: &DeleteSource, source_condition: &str) -> String {
    format!(
        "SELECT\n  {}\nFROM\n  `{}`\nWHERE\n  {source_condition}",
        source.field,
        source.table.sql_id()
    )
}

/// Estimate the bytes scanned for every distinct source of `tasks`.
///
/// At most `parallelism` dry runs are in flight at once.
///
/// # Errors
///
/// Returns the first warehouse error from the dry runs.
pub async fn estimate_source_bytes(
    warehouse: Arc<dyn Warehouse>,
    tasks: &[Task],
    source_condition: &str,
    parallelism: usize,
) -> Result<HashMap<DeleteSource, u64>, ShredError> {
    let mut distinct: Vec<DeleteSource> = Vec::new();
    for source in tasks.iter().flat_map(|t| &t.sources) {
        if !distinct.contains(source) {
            distinct.push(source.clone());
        }
    }

    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut estimates = JoinSet::new();
    for source in distinct {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| ShredError::TaskPanicked(format!("estimate semaphore closed: {e}")))?;
        let warehouse = Arc::clone(&warehouse);
        let sql = source_scan_sql(&source, source_condition);
        estimates.spawn(async move {
            let job = warehouse.query(&sql, &QueryJobConfig::dry_run()).await;
            drop(permit);
            Ok::<_, ShredError>((source, job?.total_bytes_processed.unwrap_or(0)))
        });
    }

    let mut bytes = HashMap::new();
    while let Some(joined) = estimates.join_next().await {
        match joined {
            Ok(Ok((source, estimate))) => {
                bytes.insert(source, estimate);
            }
            Ok(Err(error)) => {
                estimates.abort_all();
                return Err(error);
            }
            Err(join_err) => {
                estimates.abort_all();
                return Err(ShredError::TaskPanicked(format!(
                    "source estimate panicked: {join_err}"
                )));
            }
        }
    }
    Ok(bytes)
}

/// One audit row per task, in task order.
#[must_use]
pub fn build_records(
    tasks: &[Task],
    window: &DateWindow,
    source_bytes: &HashMap<DeleteSource, u64>,
) -> Vec<TaskRecord> {
    tasks
        .iter()
        .map(|task| TaskRecord {
            task_id: task.task_id.clone(),
            start_date: window.start,
            end_date: window.end,
            target: task.table_id(),
            target_rows: task.table.num_rows,
            target_bytes: task.table.num_bytes,
            source_bytes: task
                .sources
                .iter()
                .filter_map(|s| source_bytes.get(s))
                .sum(),
        })
        .collect()
}

/// Insert `records` in batches of at most [`INSERT_BATCH_SIZE`].
///
/// # Errors
///
/// Returns the first ledger error; rejected rows abort the remaining batches.
pub async fn write_records(ledger: &dyn TaskLedger, records: &[TaskRecord]) -> Result<u64, ShredError> {
    let mut inserted = 0;
    for batch in records.chunks(INSERT_BATCH_SIZE) {
        inserted += ledger.record_tasks(batch).await?;
    }
    tracing::info!(
        task_table = %ledger.task_location(),
        rows = inserted,
        "Recorded task audit rows"
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use shredder_state::error::Result as StateResult;
    use shredder_types::partition::Partition;
    use shredder_types::state::TaskId;
    use shredder_types::table::{DeleteTarget, TableRef};
    use shredder_types::warehouse::{
        CopyJobConfig, Job, JobKind, JobRef, TableMetadata, TableSpec,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::query::Statement;
    use crate::task::TaskPlan;
    use crate::warehouse::{InMemoryWarehouse, Row, WarehouseError};

    fn source(table: &str) -> DeleteSource {
        DeleteSource::new(TableRef::new("p", "src", table), "client_id")
    }

    fn task(table: &str, sources: Vec<DeleteSource>) -> Task {
        let meta = TableMetadata::new(TableRef::new("p", "d", table)).with_size(5, 50);
        Task {
            target: DeleteTarget::new(meta.table.clone(), vec!["client_id".into(); sources.len()]),
            table: Arc::new(meta),
            sources,
            partition: Partition::whole_table("TRUE"),
            task_id: TaskId::new(format!("p.d.{table}")),
            plan: TaskPlan::Single(Statement {
                sql: "DELETE".into(),
                config: QueryJobConfig::default(),
            }),
        }
    }

    #[derive(Default)]
    struct CountingLedger {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl TaskLedger for CountingLedger {
        fn task_location(&self) -> String {
            "counting".into()
        }

        async fn ensure_task_table(&self, _create_if_missing: bool) -> StateResult<bool> {
            Ok(true)
        }

        async fn record_tasks(&self, records: &[TaskRecord]) -> StateResult<u64> {
            self.batches.lock().unwrap().push(records.len());
            Ok(records.len() as u64)
        }
    }

    #[tokio::test]
    async fn sources_are_estimated_once() {
        let wh = InMemoryWarehouse::new("billing");
        wh.set_query_bytes("`p.src.a`", 100);
        wh.set_query_bytes("`p.src.b`", 7);
        let tasks = vec![
            task("t1", vec![source("a")]),
            task("t2", vec![source("a"), source("b")]),
        ];
        let bytes = estimate_source_bytes(Arc::new(wh.clone()), &tasks, "COND", 4)
            .await
            .unwrap();
        assert_eq!(wh.queries().len(), 2);
        assert!(wh.queries().iter().all(|q| q.config.dry_run && q.sql.ends_with("COND")));

        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        );
        let records = build_records(&tasks, &window, &bytes);
        assert_eq!(records[0].source_bytes, 100);
        assert_eq!(records[1].source_bytes, 107);
        assert_eq!(records[1].target, "p.d.t2");
        assert_eq!(records[1].target_rows, Some(5));
        assert_eq!(records[1].target_bytes, Some(50));
    }

    /// Dry runs that take a while, tracking how many overlap.
    #[derive(Default)]
    struct SlowDryRuns {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Warehouse for SlowDryRuns {
        fn project(&self) -> &str {
            "billing"
        }

        async fn get_table(&self, _table: &TableRef) -> crate::warehouse::Result<Option<TableMetadata>> {
            Ok(None)
        }

        async fn create_table(&self, _spec: &TableSpec) -> crate::warehouse::Result<()> {
            Ok(())
        }

        async fn list_partition_ids(&self, _table: &TableRef) -> crate::warehouse::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn query(&self, _sql: &str, config: &QueryJobConfig) -> crate::warehouse::Result<Job> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Job {
                reference: None,
                kind: JobKind::Query,
                created: chrono::Utc::now(),
                ended: true,
                errors: Vec::new(),
                destination: config.destination.clone(),
                total_bytes_processed: Some(1),
                num_dml_affected_rows: None,
            })
        }

        async fn copy_tables(
            &self,
            _sources: &[String],
            _destination: &str,
            _config: &CopyJobConfig,
        ) -> crate::warehouse::Result<Job> {
            Err(WarehouseError::Request("copy not supported".into()))
        }

        async fn get_job(&self, job: &JobRef) -> crate::warehouse::Result<Job> {
            Err(WarehouseError::NotFound(job.full_id()))
        }

        async fn wait_job(&self, job: &JobRef) -> crate::warehouse::Result<Job> {
            Err(WarehouseError::NotFound(job.full_id()))
        }

        async fn query_rows(&self, _sql: &str) -> crate::warehouse::Result<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn insert_rows(
            &self,
            _table: &TableRef,
            _rows: &[serde_json::Value],
        ) -> crate::warehouse::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_datasets(&self, _project: &str) -> crate::warehouse::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_tables(&self, _project: &str, _dataset: &str) -> crate::warehouse::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn source_estimates_respect_parallelism() {
        let wh = Arc::new(SlowDryRuns::default());
        let tasks: Vec<Task> = (0..12)
            .map(|i| task(&format!("t{i}"), vec![source(&format!("s{i}"))]))
            .collect();

        let bytes = estimate_source_bytes(wh.clone(), &tasks, "TRUE", 3)
            .await
            .unwrap();

        assert_eq!(bytes.len(), 12);
        assert_eq!(wh.calls.load(Ordering::SeqCst), 12);
        assert_eq!(wh.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn records_are_written_in_batches() {
        let ledger = CountingLedger::default();
        let record = TaskRecord {
            task_id: TaskId::new("p.d.t"),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            target: "p.d.t".into(),
            target_rows: None,
            target_bytes: None,
            source_bytes: 0,
        };
        let records = vec![record; INSERT_BATCH_SIZE * 2 + 1];
        assert_eq!(write_records(&ledger, &records).await.unwrap(), 20_001);
        assert_eq!(*ledger.batches.lock().unwrap(), vec![10_000, 10_000, 1]);
    }

    #[test]
    fn scan_sql_selects_source_field() {
        assert_eq!(
            source_scan_sql(&source("a"), "TRUE"),
            "SELECT\n  client_id\nFROM\n  `p.src.a`\nWHERE\n  TRUE"
        );
    }
}
