//! Deterministic in-process [`Warehouse`].
//!
//! Test double compiled under the `testing` feature. Jobs complete immediately
//! unless [`InMemoryWarehouse::hold_jobs`] is set. Every query and copy is
//! recorded so callers can assert on the exact statements issued.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use shredder_types::table::TableRef;
use shredder_types::warehouse::{
    CopyJobConfig, Job, JobKind, JobRef, Partitioning, QueryJobConfig, TableMetadata, TableSpec,
};

use super::{split_decorator, Result, Row, Warehouse, WarehouseError};

const LOCATION: &str = "US";

/// A query issued against the in-memory warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedQuery {
    pub sql: String,
    pub config: QueryJobConfig,
    pub billing_project: String,
}

/// A copy job issued against the in-memory warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCopy {
    pub sources: Vec<String>,
    pub destination: String,
    pub billing_project: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, TableMetadata>,
    partitions: HashMap<String, Vec<String>>,
    jobs: HashMap<String, Job>,
    next_job: u64,
    queries: Vec<RecordedQuery>,
    copies: Vec<RecordedCopy>,
    inserted: HashMap<String, Vec<Value>>,
    row_results: Vec<(String, Vec<Row>)>,
    bytes_rules: Vec<(String, u64)>,
    default_bytes: u64,
    affected_rows: u64,
    failures: Vec<(String, String)>,
    reject_inserts: Option<String>,
    hold_jobs: bool,
}

impl MemoryState {
    fn bytes_for(&self, sql: &str) -> u64 {
        self.bytes_rules
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(self.default_bytes, |(_, bytes)| *bytes)
    }

    fn failure_for(&self, text: &str) -> Option<String> {
        self.failures
            .iter()
            .find(|(pattern, _)| text.contains(pattern.as_str()))
            .map(|(_, message)| message.clone())
    }

    fn next_reference(&mut self, project: &str) -> JobRef {
        self.next_job += 1;
        JobRef::new(
            project,
            Some(LOCATION.to_string()),
            format!("job_{:05}", self.next_job),
        )
    }

    /// Materialize a job destination so later existence checks see it.
    fn ensure_destination(&mut self, destination: &str, clustering: Option<&Vec<String>>) {
        let (table_id, _) = split_decorator(destination);
        let Ok(table) = TableRef::parse(table_id, None) else {
            return;
        };
        self.tables.entry(table.sql_id()).or_insert_with(|| {
            let mut meta = TableMetadata::new(table);
            meta.clustering_fields = clustering.cloned();
            meta
        });
    }
}

/// In-memory warehouse sharing state between every client handle.
#[derive(Debug, Clone)]
pub struct InMemoryWarehouse {
    project: String,
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryWarehouse {
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Another client handle over the same warehouse, billing `project`.
    #[must_use]
    pub fn with_billing_project(&self, project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- seeding ------------------------------------------------------------

    pub fn add_table(&self, table: TableMetadata) {
        self.state().tables.insert(table.table.sql_id(), table);
    }

    pub fn add_partitions<I, S>(&self, table: &TableRef, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .partitions
            .entry(table.sql_id())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
    }

    pub fn drop_table(&self, table: &TableRef) {
        let mut state = self.state();
        state.tables.remove(&table.sql_id());
        state.partitions.remove(&table.sql_id());
    }

    /// Insert a pre-existing job, e.g. one referenced by a ledger entry.
    pub fn add_job(&self, job: Job) {
        if let Some(reference) = &job.reference {
            self.state().jobs.insert(reference.full_id(), job);
        }
    }

    /// Bytes reported by queries whose SQL contains `pattern`.
    pub fn set_query_bytes(&self, pattern: impl Into<String>, bytes: u64) {
        self.state().bytes_rules.push((pattern.into(), bytes));
    }

    pub fn set_default_bytes(&self, bytes: u64) {
        self.state().default_bytes = bytes;
    }

    /// Rows reported as affected by every `DELETE` statement.
    pub fn set_affected_rows(&self, rows: u64) {
        self.state().affected_rows = rows;
    }

    /// Jobs whose SQL or destination contains `pattern` finish with `message`.
    pub fn fail_queries_containing(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.state().failures.push((pattern.into(), message.into()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Rows returned by [`Warehouse::query_rows`] for SQL containing `pattern`.
    pub fn set_query_rows(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.state().row_results.push((pattern.into(), rows));
    }

    /// Reject every streamed row with `message`.
    pub fn reject_inserts(&self, message: impl Into<String>) {
        self.state().reject_inserts = Some(message.into());
    }

    /// Leave new jobs running until they are waited on.
    pub fn hold_jobs(&self, hold: bool) {
        self.state().hold_jobs = hold;
    }

    // -- inspection ---------------------------------------------------------

    #[must_use]
    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.state().queries.clone()
    }

    /// Queries that were not dry runs.
    #[must_use]
    pub fn executed_queries(&self) -> Vec<RecordedQuery> {
        self.state()
            .queries
            .iter()
            .filter(|q| !q.config.dry_run)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn copies(&self) -> Vec<RecordedCopy> {
        self.state().copies.clone()
    }

    #[must_use]
    pub fn inserted_rows(&self, table: &TableRef) -> Vec<Value> {
        self.state()
            .inserted
            .get(&table.sql_id())
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn table(&self, table: &TableRef) -> Option<TableMetadata> {
        self.state().tables.get(&table.sql_id()).cloned()
    }

    /// Number of persisted (non dry-run) jobs created so far.
    #[must_use]
    pub fn jobs_created(&self) -> u64 {
        self.state().next_job
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    fn project(&self) -> &str {
        &self.project
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableMetadata>> {
        Ok(self.state().tables.get(&table.sql_id()).cloned())
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<()> {
        let mut state = self.state();
        let key = spec.table.sql_id();
        if state.tables.contains_key(&key) {
            return Err(WarehouseError::Api {
                status: 409,
                message: format!("Already Exists: Table {key}"),
            });
        }
        let mut meta = TableMetadata::new(spec.table.clone())
            .with_columns(spec.fields.iter().map(|f| f.name.clone()));
        if spec.time_partitioned {
            meta = meta.with_partitioning(Partitioning::Time { field: None });
        }
        state.tables.insert(key, meta);
        Ok(())
    }

    async fn list_partition_ids(&self, table: &TableRef) -> Result<Vec<String>> {
        let state = self.state();
        let key = table.sql_id();
        if !state.tables.contains_key(&key) {
            return Err(WarehouseError::NotFound(key));
        }
        Ok(state.partitions.get(&key).cloned().unwrap_or_default())
    }

    async fn query(&self, sql: &str, config: &QueryJobConfig) -> Result<Job> {
        let mut state = self.state();
        state.queries.push(RecordedQuery {
            sql: sql.to_string(),
            config: config.clone(),
            billing_project: self.project.clone(),
        });
        let failure = state.failure_for(sql);
        let bytes = state.bytes_for(sql);

        if config.dry_run {
            if let Some(message) = failure {
                return Err(WarehouseError::Api {
                    status: 400,
                    message,
                });
            }
            return Ok(Job {
                reference: None,
                kind: JobKind::Query,
                created: Utc::now(),
                ended: true,
                errors: Vec::new(),
                destination: config.destination.clone(),
                total_bytes_processed: Some(bytes),
                num_dml_affected_rows: None,
            });
        }

        let reference = state.next_reference(&self.project);
        if let Some(destination) = &config.destination {
            if failure.is_none() {
                state.ensure_destination(destination, config.clustering_fields.as_ref());
            }
        }
        let is_delete = sql.trim_start().to_ascii_uppercase().starts_with("DELETE");
        let job = Job {
            reference: Some(reference.clone()),
            kind: JobKind::Query,
            created: Utc::now(),
            ended: !state.hold_jobs,
            errors: failure.into_iter().collect(),
            destination: config.destination.clone(),
            total_bytes_processed: Some(bytes),
            num_dml_affected_rows: is_delete.then_some(state.affected_rows),
        };
        state.jobs.insert(reference.full_id(), job.clone());
        Ok(job)
    }

    async fn copy_tables(
        &self,
        sources: &[String],
        destination: &str,
        _config: &CopyJobConfig,
    ) -> Result<Job> {
        let mut state = self.state();
        state.copies.push(RecordedCopy {
            sources: sources.to_vec(),
            destination: destination.to_string(),
            billing_project: self.project.clone(),
        });
        let missing: Vec<String> = sources
            .iter()
            .filter(|source| {
                let (table_id, _) = split_decorator(source);
                TableRef::parse(table_id, None)
                    .map_or(true, |t| !state.tables.contains_key(&t.sql_id()))
            })
            .map(|source| format!("Not found: Table {source}"))
            .collect();
        let failure = state.failure_for(destination);
        let reference = state.next_reference(&self.project);
        let mut errors = missing;
        errors.extend(failure);
        if errors.is_empty() {
            state.ensure_destination(destination, None);
        }
        let job = Job {
            reference: Some(reference.clone()),
            kind: JobKind::Copy,
            created: Utc::now(),
            ended: !state.hold_jobs,
            errors,
            destination: Some(destination.to_string()),
            total_bytes_processed: None,
            num_dml_affected_rows: None,
        };
        state.jobs.insert(reference.full_id(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, job: &JobRef) -> Result<Job> {
        self.state()
            .jobs
            .get(&job.full_id())
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound(job.full_id()))
    }

    async fn wait_job(&self, job: &JobRef) -> Result<Job> {
        let mut state = self.state();
        let stored = state
            .jobs
            .get_mut(&job.full_id())
            .ok_or_else(|| WarehouseError::NotFound(job.full_id()))?;
        stored.ended = true;
        Ok(stored.clone())
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let mut state = self.state();
        state.queries.push(RecordedQuery {
            sql: sql.to_string(),
            config: QueryJobConfig::default(),
            billing_project: self.project.clone(),
        });
        if let Some(message) = state.failure_for(sql) {
            return Err(WarehouseError::JobFailed {
                job_id: "query_rows".into(),
                errors: vec![message],
            });
        }
        Ok(state
            .row_results
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Value]) -> Result<Vec<String>> {
        let mut state = self.state();
        let key = table.sql_id();
        if !state.tables.contains_key(&key) {
            return Err(WarehouseError::NotFound(key));
        }
        if let Some(message) = &state.reject_inserts {
            return Ok(rows
                .iter()
                .enumerate()
                .map(|(index, _)| format!("row {index}: {message}"))
                .collect());
        }
        state.inserted.entry(key).or_default().extend_from_slice(rows);
        Ok(Vec::new())
    }

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>> {
        let datasets: BTreeSet<String> = self
            .state()
            .tables
            .values()
            .filter(|meta| meta.table.project == project)
            .map(|meta| meta.table.dataset.clone())
            .collect();
        Ok(datasets.into_iter().collect())
    }

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .tables
            .values()
            .filter(|meta| meta.table.project == project && meta.table.dataset == dataset)
            .map(|meta| meta.table.table.clone())
            .collect())
    }
}
