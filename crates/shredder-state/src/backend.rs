//! Ledger traits and the per-run ledger snapshot.
//!
//! The job ledger ([`StateLedger`]) maps task ids to the warehouse job that
//! performed them; the task ledger ([`TaskLedger`]) records one audit row per
//! planned task. Both are append-only.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use shredder_types::state::{LedgerEntry, TaskId, TaskRecord};

use crate::error;

/// Storage contract for the job ledger.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateLedger>`.
#[async_trait]
pub trait StateLedger: Send + Sync {
    /// Human-readable location, used in log messages.
    fn state_location(&self) -> String;

    /// Check that the ledger table exists, creating it when
    /// `create_if_missing` is set. Returns whether the table exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    async fn ensure_state_table(&self, create_if_missing: bool) -> error::Result<bool>;

    /// `(task_id, full_job_id)` pairs recorded for `end_date`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    async fn load_jobs(&self, end_date: NaiveDate) -> error::Result<Vec<(TaskId, String)>>;

    /// Append one ledger entry.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InsertRejected`](crate::error::StateError::InsertRejected)
    /// if the row is refused, or another variant on storage failure.
    async fn record_job(&self, entry: &LedgerEntry) -> error::Result<()>;
}

/// Storage contract for the task audit ledger.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Human-readable location, used in log messages.
    fn task_location(&self) -> String;

    /// See [`StateLedger::ensure_state_table`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    async fn ensure_task_table(&self, create_if_missing: bool) -> error::Result<bool>;

    /// Append a batch of task rows. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InsertRejected`](crate::error::StateError::InsertRejected)
    /// if any row is refused, or another variant on storage failure.
    async fn record_tasks(&self, records: &[TaskRecord]) -> error::Result<u64>;
}

/// Read-only view of the job ledger taken once at the start of a run.
///
/// Writes made during the run are not reflected here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    jobs: HashMap<TaskId, String>,
}

impl LedgerSnapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from entries ordered oldest first; later entries win.
    pub fn from_ordered(entries: impl IntoIterator<Item = (TaskId, String)>) -> Self {
        Self {
            jobs: entries.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<&str> {
        self.jobs.get(task_id).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Prepare the job ledger and take the snapshot for `end_date`.
///
/// When the table is missing and `create_if_missing` is false (dry runs),
/// the snapshot is empty.
///
/// # Errors
///
/// Returns [`StateError`](crate::error::StateError) on storage failure.
pub async fn load_snapshot(
    ledger: &dyn StateLedger,
    end_date: NaiveDate,
    create_if_missing: bool,
) -> error::Result<LedgerSnapshot> {
    if !ledger.ensure_state_table(create_if_missing).await? {
        tracing::info!(
            state_table = %ledger.state_location(),
            "State table does not exist, starting without recorded state"
        );
        return Ok(LedgerSnapshot::empty());
    }
    let snapshot = LedgerSnapshot::from_ordered(ledger.load_jobs(end_date).await?);
    tracing::info!(
        state_table = %ledger.state_location(),
        %end_date,
        entries = snapshot.len(),
        "Loaded job ledger snapshot"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _assert_state(_: &dyn StateLedger) {}
        fn _assert_tasks(_: &dyn TaskLedger) {}
    }

    #[test]
    fn snapshot_latest_entry_wins() {
        let snapshot = LedgerSnapshot::from_ordered(vec![
            (TaskId::new("t$1"), "p:US.old".to_string()),
            (TaskId::new("t$2"), "p:US.other".to_string()),
            (TaskId::new("t$1"), "p:US.new".to_string()),
        ]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&TaskId::new("t$1")), Some("p:US.new"));
        assert_eq!(snapshot.get(&TaskId::new("missing")), None);
    }

    #[test]
    fn empty_snapshot() {
        assert!(LedgerSnapshot::empty().is_empty());
    }
}
