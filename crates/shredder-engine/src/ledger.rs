//! Warehouse-backed ledgers and ledger resolution.
//!
//! `--state-table` and `--task-table` name either a warehouse table
//! (`project.dataset.table`) or a local SQLite file (`sqlite:<path>`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, SecondsFormat};
use serde_json::{json, Value};
use shredder_state::error::Result as StateResult;
use shredder_state::{SqliteLedger, StateError, StateLedger, TaskLedger};
use shredder_types::state::{LedgerEntry, TaskId, TaskRecord};
use shredder_types::table::TableRef;
use shredder_types::warehouse::{FieldSpec, TableSpec};

use crate::errors::ShredError;
use crate::warehouse::{Row, Warehouse};

const SQLITE_PREFIX: &str = "sqlite:";

/// Schema of the job ledger table.
#[must_use]
pub fn state_table_spec(table: &TableRef) -> TableSpec {
    TableSpec {
        table: table.clone(),
        fields: vec![
            FieldSpec::new("task_id", "STRING"),
            FieldSpec::new("job_id", "STRING"),
            FieldSpec::new("job_created", "TIMESTAMP"),
            FieldSpec::new("start_date", "DATE"),
            FieldSpec::new("end_date", "DATE"),
        ],
        time_partitioned: false,
    }
}

/// Schema of the task audit table. Partitioned by ingestion day.
#[must_use]
pub fn task_table_spec(table: &TableRef) -> TableSpec {
    TableSpec {
        table: table.clone(),
        fields: vec![
            FieldSpec::new("task_id", "STRING"),
            FieldSpec::new("start_date", "DATE"),
            FieldSpec::new("end_date", "DATE"),
            FieldSpec::new("target", "STRING"),
            FieldSpec::new("target_rows", "INT64"),
            FieldSpec::new("target_bytes", "INT64"),
            FieldSpec::new("source_bytes", "INT64"),
        ],
        time_partitioned: true,
    }
}

async fn ensure_table(
    warehouse: &dyn Warehouse,
    spec: TableSpec,
    create_if_missing: bool,
) -> StateResult<bool> {
    let existing = warehouse
        .get_table(&spec.table)
        .await
        .map_err(|e| StateError::backend_context("ensure_table: get", e))?;
    if existing.is_some() {
        return Ok(true);
    }
    if !create_if_missing {
        return Ok(false);
    }
    tracing::info!(table = %spec.table, "Creating ledger table");
    warehouse
        .create_table(&spec)
        .await
        .map_err(|e| StateError::backend_context("ensure_table: create", e))?;
    Ok(true)
}

async fn insert(warehouse: &dyn Warehouse, table: &TableRef, rows: &[Value]) -> StateResult<()> {
    let errors = warehouse
        .insert_rows(table, rows)
        .await
        .map_err(|e| StateError::backend_context("insert_rows", e))?;
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StateError::InsertRejected {
            table: table.sql_id(),
            errors,
        })
    }
}

fn string_column(row: &Row, column: &str) -> StateResult<String> {
    row.get(column)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| StateError::Corrupt(format!("missing string column {column} in {row:?}")))
}

/// Job ledger stored in a warehouse table.
pub struct WarehouseStateTable {
    warehouse: Arc<dyn Warehouse>,
    table: TableRef,
}

impl WarehouseStateTable {
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, table: TableRef) -> Self {
        Self { warehouse, table }
    }
}

#[async_trait]
impl StateLedger for WarehouseStateTable {
    fn state_location(&self) -> String {
        self.table.sql_id()
    }

    async fn ensure_state_table(&self, create_if_missing: bool) -> StateResult<bool> {
        ensure_table(self.warehouse.as_ref(), state_table_spec(&self.table), create_if_missing).await
    }

    async fn load_jobs(&self, end_date: NaiveDate) -> StateResult<Vec<(TaskId, String)>> {
        let sql = format!(
            "SELECT\n  task_id,\n  job_id,\nFROM\n  `{}`\nWHERE\n  end_date = '{end_date}'\nORDER BY\n  job_created",
            self.table.sql_id()
        );
        let rows = self
            .warehouse
            .query_rows(&sql)
            .await
            .map_err(|e| StateError::backend_context("load_jobs", e))?;
        rows.iter()
            .map(|row| {
                Ok((
                    TaskId::new(string_column(row, "task_id")?),
                    string_column(row, "job_id")?,
                ))
            })
            .collect()
    }

    async fn record_job(&self, entry: &LedgerEntry) -> StateResult<()> {
        let row = json!({
            "task_id": entry.task_id.as_str(),
            "job_id": entry.job_id,
            "job_created": entry.job_created.to_rfc3339_opts(SecondsFormat::Micros, true),
            "start_date": entry.start_date.to_string(),
            "end_date": entry.end_date.to_string(),
        });
        insert(self.warehouse.as_ref(), &self.table, &[row]).await
    }
}

/// Task audit ledger stored in a warehouse table.
pub struct WarehouseTaskTable {
    warehouse: Arc<dyn Warehouse>,
    table: TableRef,
}

impl WarehouseTaskTable {
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, table: TableRef) -> Self {
        Self { warehouse, table }
    }
}

#[async_trait]
impl TaskLedger for WarehouseTaskTable {
    fn task_location(&self) -> String {
        self.table.sql_id()
    }

    async fn ensure_task_table(&self, create_if_missing: bool) -> StateResult<bool> {
        ensure_table(self.warehouse.as_ref(), task_table_spec(&self.table), create_if_missing).await
    }

    async fn record_tasks(&self, records: &[TaskRecord]) -> StateResult<u64> {
        let rows: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "task_id": r.task_id.as_str(),
                    "start_date": r.start_date.to_string(),
                    "end_date": r.end_date.to_string(),
                    "target": r.target,
                    "target_rows": r.target_rows,
                    "target_bytes": r.target_bytes,
                    "source_bytes": r.source_bytes,
                })
            })
            .collect();
        insert(self.warehouse.as_ref(), &self.table, &rows).await?;
        Ok(rows.len() as u64)
    }
}

/// Where a ledger lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerLocation {
    Sqlite(PathBuf),
    Warehouse(TableRef),
}

impl LedgerLocation {
    /// Parse `sqlite:<path>` or a warehouse table id, qualifying a
    /// `dataset.table` id with `default_project`.
    ///
    /// # Errors
    ///
    /// Returns [`ShredError::InvalidConfig`] for an empty SQLite path, or
    /// [`ShredError::Table`] for a malformed table id.
    pub fn parse(raw: &str, default_project: &str) -> Result<Self, ShredError> {
        if let Some(path) = raw.strip_prefix(SQLITE_PREFIX) {
            if path.is_empty() {
                return Err(ShredError::InvalidConfig(vec![format!(
                    "ledger location '{raw}' has an empty sqlite path"
                )]));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        Ok(Self::Warehouse(TableRef::parse(raw, Some(default_project))?))
    }
}

/// The ledgers configured for a run. Either may be disabled.
#[derive(Default)]
pub struct Ledgers {
    pub state: Option<Arc<dyn StateLedger>>,
    pub tasks: Option<Arc<dyn TaskLedger>>,
}

impl std::fmt::Debug for Ledgers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledgers")
            .field("state", &self.state.as_ref().map(|l| l.state_location()))
            .field("tasks", &self.tasks.as_ref().map(|l| l.task_location()))
            .finish()
    }
}

impl Ledgers {
    /// Open the configured ledgers. Warehouse ledgers use `warehouse`;
    /// SQLite ledgers pointing at the same file share one connection.
    ///
    /// # Errors
    ///
    /// Returns location parse errors, or [`ShredError::State`] if a SQLite
    /// file can't be opened.
    pub fn open(
        state_table: Option<&str>,
        task_table: Option<&str>,
        warehouse: &Arc<dyn Warehouse>,
    ) -> Result<Self, ShredError> {
        let project = warehouse.project().to_string();
        let mut sqlite: HashMap<PathBuf, Arc<SqliteLedger>> = HashMap::new();
        let mut open_sqlite = |path: PathBuf| -> Result<Arc<SqliteLedger>, ShredError> {
            if let Some(ledger) = sqlite.get(&path) {
                return Ok(Arc::clone(ledger));
            }
            let ledger = Arc::new(SqliteLedger::open(&path)?);
            sqlite.insert(path, Arc::clone(&ledger));
            Ok(ledger)
        };

        let mut ledgers = Self::default();
        if let Some(raw) = state_table {
            let ledger: Arc<dyn StateLedger> = match LedgerLocation::parse(raw, &project)? {
                LedgerLocation::Sqlite(path) => open_sqlite(path)?,
                LedgerLocation::Warehouse(table) => {
                    Arc::new(WarehouseStateTable::new(Arc::clone(warehouse), table))
                }
            };
            ledgers.state = Some(ledger);
        }
        if let Some(raw) = task_table {
            let ledger: Arc<dyn TaskLedger> = match LedgerLocation::parse(raw, &project)? {
                LedgerLocation::Sqlite(path) => open_sqlite(path)?,
                LedgerLocation::Warehouse(table) => {
                    Arc::new(WarehouseTaskTable::new(Arc::clone(warehouse), table))
                }
            };
            ledgers.tasks = Some(ledger);
        }
        Ok(ledgers)
    }
}
