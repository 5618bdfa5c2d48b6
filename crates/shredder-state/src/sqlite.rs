//! `SQLite`-backed implementation of [`StateLedger`] and [`TaskLedger`].
//!
//! Uses a single `Mutex<Connection>` for thread safety; every operation runs
//! on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use shredder_types::state::{LedgerEntry, TaskId, TaskRecord};

use crate::backend::{StateLedger, TaskLedger};
use crate::error::{self, StateError};

const DATE_FMT: &str = "%Y-%m-%d";

const CREATE_STATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS shredder_state (
    task_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    job_created TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_state_end_date ON shredder_state (end_date, job_created);
";

const CREATE_TASK_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS shredder_tasks (
    task_id TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    target TEXT NOT NULL,
    target_rows INTEGER,
    target_bytes INTEGER,
    source_bytes INTEGER NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

/// `SQLite`-backed ledger storage.
///
/// Holds both the job ledger (`shredder_state`) and the task audit ledger
/// (`shredder_tasks`). Create with [`SqliteLedger::open`] for file-backed
/// persistence or [`SqliteLedger::in_memory`] for tests.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    location: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open or create a `SQLite` ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location: path.to_path_buf(),
        })
    }

    /// Create an in-memory `SQLite` ledger (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location: PathBuf::from(":memory:"),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> error::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> error::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StateError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StateError::Join(e.to_string()))?
    }

    fn table_exists(conn: &Connection, name: &str) -> error::Result<bool> {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .map_err(StateError::backend)
    }

    fn ensure_table(
        conn: &Connection,
        name: &str,
        ddl: &str,
        create_if_missing: bool,
    ) -> error::Result<bool> {
        if Self::table_exists(conn, name)? {
            return Ok(true);
        }
        if !create_if_missing {
            return Ok(false);
        }
        conn.execute_batch(ddl)
            .map_err(|e| StateError::backend_context("ensure_table: create", e))?;
        Ok(true)
    }

    /// Fixed-width UTC timestamp so lexical order matches time order.
    fn format_timestamp(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn to_i64(value: Option<u64>) -> Option<i64> {
        value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
    }

    #[cfg(test)]
    fn count_rows(&self, table: &str) -> error::Result<i64> {
        let conn = self.conn.lock().map_err(|_| StateError::LockPoisoned)?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(StateError::backend)
    }
}

#[async_trait]
impl StateLedger for SqliteLedger {
    fn state_location(&self) -> String {
        format!("sqlite:{}#shredder_state", self.location.display())
    }

    async fn ensure_state_table(&self, create_if_missing: bool) -> error::Result<bool> {
        self.with_conn(move |conn| {
            Self::ensure_table(conn, "shredder_state", CREATE_STATE_TABLE, create_if_missing)
        })
        .await
    }

    async fn load_jobs(&self, end_date: NaiveDate) -> error::Result<Vec<(TaskId, String)>> {
        let end = end_date.format(DATE_FMT).to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT task_id, job_id FROM shredder_state \
                     WHERE end_date = ?1 ORDER BY job_created, rowid",
                )
                .map_err(|e| StateError::backend_context("load_jobs: prepare", e))?;
            let rows = stmt
                .query_map([end], |row| {
                    Ok((TaskId::new(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
                })
                .map_err(|e| StateError::backend_context("load_jobs: query", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StateError::backend_context("load_jobs: read", e))
        })
        .await
    }

    async fn record_job(&self, entry: &LedgerEntry) -> error::Result<()> {
        let params = (
            entry.task_id.as_str().to_string(),
            entry.job_id.clone(),
            Self::format_timestamp(&entry.job_created),
            entry.start_date.format(DATE_FMT).to_string(),
            entry.end_date.format(DATE_FMT).to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO shredder_state (task_id, job_id, job_created, start_date, end_date) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![params.0, params.1, params.2, params.3, params.4],
            )
            .map_err(|e| StateError::backend_context("record_job: insert", e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskLedger for SqliteLedger {
    fn task_location(&self) -> String {
        format!("sqlite:{}#shredder_tasks", self.location.display())
    }

    async fn ensure_task_table(&self, create_if_missing: bool) -> error::Result<bool> {
        self.with_conn(move |conn| {
            Self::ensure_table(conn, "shredder_tasks", CREATE_TASK_TABLE, create_if_missing)
        })
        .await
    }

    async fn record_tasks(&self, records: &[TaskRecord]) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StateError::backend_context("record_tasks: begin tx", e))?;
            let mut count = 0u64;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO shredder_tasks \
                         (task_id, start_date, end_date, target, target_rows, target_bytes, source_bytes) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .map_err(|e| StateError::backend_context("record_tasks: prepare", e))?;
                for record in &records {
                    stmt.execute(rusqlite::params![
                        record.task_id.as_str(),
                        record.start_date.format(DATE_FMT).to_string(),
                        record.end_date.format(DATE_FMT).to_string(),
                        record.target,
                        Self::to_i64(record.target_rows),
                        Self::to_i64(record.target_bytes),
                        Self::to_i64(Some(record.source_bytes)),
                    ])
                    .map_err(|e| StateError::backend_context("record_tasks: execute", e))?;
                    count += 1;
                }
            }
            tx.commit()
                .map_err(|e| StateError::backend_context("record_tasks: commit", e))?;
            Ok(count)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::load_snapshot;
    use chrono::TimeZone;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FMT).unwrap()
    }

    fn entry(task: &str, job: &str, created_secs: i64, end: &str) -> LedgerEntry {
        LedgerEntry {
            task_id: TaskId::new(task),
            job_id: job.to_string(),
            job_created: Utc.timestamp_opt(created_secs, 0).unwrap(),
            start_date: date("2024-01-01"),
            end_date: date(end),
        }
    }

    #[tokio::test]
    async fn ensure_without_create_reports_missing() {
        let ledger = SqliteLedger::in_memory().unwrap();
        assert!(!ledger.ensure_state_table(false).await.unwrap());
        assert!(ledger.ensure_state_table(true).await.unwrap());
        assert!(ledger.ensure_state_table(false).await.unwrap());
        assert!(!ledger.ensure_task_table(false).await.unwrap());
    }

    #[tokio::test]
    async fn load_jobs_filters_by_end_date_and_orders_by_creation() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger.ensure_state_table(true).await.unwrap();
        ledger
            .record_job(&entry("t$1", "p:US.second", 200, "2024-01-15"))
            .await
            .unwrap();
        ledger
            .record_job(&entry("t$1", "p:US.first", 100, "2024-01-15"))
            .await
            .unwrap();
        ledger
            .record_job(&entry("t$1", "p:US.other_day", 300, "2024-01-16"))
            .await
            .unwrap();

        let jobs = ledger.load_jobs(date("2024-01-15")).await.unwrap();
        assert_eq!(
            jobs,
            vec![
                (TaskId::new("t$1"), "p:US.first".to_string()),
                (TaskId::new("t$1"), "p:US.second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_uses_most_recent_entry() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger.ensure_state_table(true).await.unwrap();
        ledger
            .record_job(&entry("t", "p:US.old", 100, "2024-01-15"))
            .await
            .unwrap();
        ledger
            .record_job(&entry("t", "p:US.new", 500, "2024-01-15"))
            .await
            .unwrap();

        let snapshot = load_snapshot(&ledger, date("2024-01-15"), false)
            .await
            .unwrap();
        assert_eq!(snapshot.get(&TaskId::new("t")), Some("p:US.new"));
    }

    #[tokio::test]
    async fn snapshot_of_missing_table_is_empty_without_create() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = load_snapshot(&ledger, date("2024-01-15"), false)
            .await
            .unwrap();
        assert!(snapshot.is_empty());
        assert!(!ledger.ensure_state_table(false).await.unwrap());
    }

    #[tokio::test]
    async fn record_tasks_inserts_batch() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger.ensure_task_table(true).await.unwrap();
        let records: Vec<TaskRecord> = (0..3)
            .map(|i| TaskRecord {
                task_id: TaskId::new(format!("t${i}")),
                start_date: date("2024-01-01"),
                end_date: date("2024-01-15"),
                target: "p.d.t".into(),
                target_rows: Some(10),
                target_bytes: None,
                source_bytes: 42,
            })
            .collect();
        assert_eq!(ledger.record_tasks(&records).await.unwrap(), 3);
        assert_eq!(ledger.record_tasks(&[]).await.unwrap(), 0);
        assert_eq!(ledger.count_rows("shredder_tasks").unwrap(), 3);
    }

    #[tokio::test]
    async fn record_job_without_table_includes_operation_context() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let err = ledger
            .record_job(&entry("t", "p:US.j", 1, "2024-01-15"))
            .await
            .expect_err("missing table should fail");
        assert!(err.to_string().contains("record_job"));
    }

    #[tokio::test]
    async fn file_backed_ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            ledger.ensure_state_table(true).await.unwrap();
            ledger
                .record_job(&entry("t$20240101", "p:EU.j1", 1, "2024-01-15"))
                .await
                .unwrap();
        }
        let reopened = SqliteLedger::open(&path).unwrap();
        assert!(reopened.state_location().contains("ledger.db"));
        let jobs = reopened.load_jobs(date("2024-01-15")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1, "p:EU.j1");
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let ts = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(
            SqliteLedger::format_timestamp(&ts),
            "1970-01-01T00:00:00.000000Z"
        );
    }
}
