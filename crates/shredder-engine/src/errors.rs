//! Engine error model.

use shredder_state::StateError;
use shredder_types::state::TaskId;
use shredder_types::table::TableRefError;
use shredder_types::warehouse::JobIdError;

use crate::warehouse::WarehouseError;

/// Errors produced while planning or executing a shredder run.
#[derive(Debug, thiserror::Error)]
pub enum ShredError {
    /// Run options failed validation. Every problem is listed.
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// `--sampling-tables` names tables that discovery did not produce.
    #[error("{} sampling tables not found in targets: {}", .0.len(), .0.join(", "))]
    MissingSamplingTables(Vec<String>),

    /// Discovery and filtering left nothing to do.
    #[error("No tables selected")]
    NoTasks,

    #[error("target discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Table(#[from] TableRefError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    State(#[from] StateError),

    /// A warehouse job finished with errors.
    #[error("job {job_id} for {task_id} failed: {}", .errors.join("; "))]
    JobFailed {
        task_id: TaskId,
        job_id: String,
        errors: Vec<String>,
    },

    #[error("invalid partition id '{id}' for {table}: {reason}")]
    InvalidPartitionId {
        table: String,
        id: String,
        reason: String,
    },

    #[error(transparent)]
    InvalidJobId(#[from] JobIdError),

    /// A job that must be waited on or recorded has no persisted reference.
    #[error("job for {0} has no job reference")]
    MissingJobReference(TaskId),

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// One or more tasks failed after every dispatched task finished.
    #[error("{failed} task(s) failed, first failure: {first}")]
    TaskFailures {
        failed: usize,
        first: Box<ShredError>,
    },
}

impl ShredError {
    /// Returns `true` for errors raised before any warehouse work starts.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::MissingSamplingTables(_) | Self::Table(_)
        )
    }
}
