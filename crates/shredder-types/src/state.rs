//! Ledger model types.
//!
//! Pure data types used by the job ledger and the task audit ledger.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::table::TableRef;

// ---------------------------------------------------------------------------
// Task identifiers
// ---------------------------------------------------------------------------

/// Deterministic identifier of a unit of deletion work.
///
/// `<project.dataset.table>` for whole-table tasks, otherwise
/// `<project.dataset.table>$<partition_id>`. Sample shards append
/// `__sample_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Task id for a table and optional partition.
    #[must_use]
    pub fn for_table(table: &TableRef, partition_id: Option<&str>) -> Self {
        match partition_id {
            Some(id) if !id.is_empty() => Self(format!("{}${id}", table.sql_id())),
            _ => Self(table.sql_id()),
        }
    }

    /// Task id of one sample shard of this task.
    #[must_use]
    pub fn sample(&self, sample_id: u8) -> Self {
        Self(format!("{}__sample_{sample_id}", self.0))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Date window
// ---------------------------------------------------------------------------

/// Deletion-request date window `[start, end)`.
///
/// `end` also bounds the data that may be touched: partitions dated on or
/// after `end` are never processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    #[must_use]
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

// ---------------------------------------------------------------------------
// Ledger rows
// ---------------------------------------------------------------------------

/// One appended row of the job ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub task_id: TaskId,
    /// Full job id, `project:location.job_id`.
    pub job_id: String,
    pub job_created: DateTime<Utc>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// One row of the task audit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub target: String,
    pub target_rows: Option<u64>,
    pub target_bytes: Option<u64>,
    pub source_bytes: u64,
}
