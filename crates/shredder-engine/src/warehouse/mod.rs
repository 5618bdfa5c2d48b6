//! Warehouse seam.
//!
//! Everything the engine needs from the data warehouse goes through the
//! [`Warehouse`] trait: table metadata, partition listing, query and copy
//! jobs, job polling, row queries and streaming inserts. [`BigQueryClient`]
//! talks to the real service. A deterministic in-memory implementation for
//! tests is available under the `testing` feature.

pub mod bigquery;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use async_trait::async_trait;
use shredder_types::table::TableRef;
use shredder_types::warehouse::{CopyJobConfig, Job, JobRef, QueryJobConfig, TableMetadata, TableSpec};

pub use bigquery::BigQueryClient;
#[cfg(any(test, feature = "testing"))]
pub use memory::InMemoryWarehouse;

/// One result row keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Errors produced by [`Warehouse`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("warehouse request failed: {0}")]
    Request(String),

    #[error("warehouse API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The response could not be decoded into the expected shape.
    #[error("unexpected warehouse response: {0}")]
    Decode(String),

    /// A query that must run to completion finished with errors.
    #[error("job {job_id} failed: {}", .errors.join("; "))]
    JobFailed { job_id: String, errors: Vec<String> },
}

impl WarehouseError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, WarehouseError>;

/// Warehouse operations used by the shredder.
///
/// Each client bills its jobs to one project. Implementations must be
/// `Send + Sync` for use behind `Arc<dyn Warehouse>`.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Project that jobs created through this client are billed to.
    fn project(&self) -> &str;

    /// Table metadata, or `None` when the table does not exist.
    async fn get_table(&self, table: &TableRef) -> Result<Option<TableMetadata>>;

    async fn create_table(&self, spec: &TableSpec) -> Result<()>;

    /// Ids of every partition currently present in `table`, including the
    /// sentinel partitions.
    async fn list_partition_ids(&self, table: &TableRef) -> Result<Vec<String>>;

    /// Start a query job. Dry runs return a finished job without a reference.
    async fn query(&self, sql: &str, config: &QueryJobConfig) -> Result<Job>;

    /// Start a copy job merging `sources` into `destination`.
    async fn copy_tables(
        &self,
        sources: &[String],
        destination: &str,
        config: &CopyJobConfig,
    ) -> Result<Job>;

    async fn get_job(&self, job: &JobRef) -> Result<Job>;

    /// Block until `job` reaches a terminal state. Job-level errors are
    /// reported in [`Job::errors`], not as `Err`.
    async fn wait_job(&self, job: &JobRef) -> Result<Job>;

    /// Run `sql` to completion and return its rows.
    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>>;

    /// Stream `rows` into `table`. Returns the per-row insert errors, empty
    /// when every row was accepted.
    async fn insert_rows(&self, table: &TableRef, rows: &[serde_json::Value]) -> Result<Vec<String>>;

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>>;

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>>;
}

/// Split a job destination such as `p.d.t$20240101` into its table and
/// optional partition decorator.
#[must_use]
pub fn split_decorator(destination: &str) -> (&str, Option<&str>) {
    match destination.split_once('$') {
        Some((table, partition)) => (table, Some(partition)),
        None => (destination, None),
    }
}
