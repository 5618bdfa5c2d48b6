//! Ledger backend error types.

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by [`StateLedger`](crate::StateLedger) and
/// [`TaskLedger`](crate::TaskLedger) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying storage failure.
    #[error("ledger backend error: {0}")]
    Backend(#[source] BoxError),

    /// Storage failure annotated with the failing operation.
    #[error("{context}: {source}")]
    BackendContext {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    /// The backend refused some of the rows of a batch insert.
    #[error("{table} rejected {} row(s): {}", .errors.len(), .errors.join("; "))]
    InsertRejected { table: String, errors: Vec<String> },

    /// A stored row could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("ledger lock poisoned")]
    LockPoisoned,

    /// A blocking ledger task panicked or was cancelled.
    #[error("ledger task failed: {0}")]
    Join(String),
}

impl StateError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    pub fn backend_context(context: &'static str, err: impl Into<BoxError>) -> Self {
        Self::BackendContext {
            context,
            source: err.into(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_context_displays_operation() {
        let err = StateError::backend_context("record_job: insert", "disk full");
        assert_eq!(err.to_string(), "record_job: insert: disk full");
    }

    #[test]
    fn insert_rejected_lists_every_row() {
        let err = StateError::InsertRejected {
            table: "p.d.state".into(),
            errors: vec!["row 0: no such field".into(), "row 3: invalid".into()],
        };
        assert_eq!(
            err.to_string(),
            "p.d.state rejected 2 row(s): row 0: no such field; row 3: invalid"
        );
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(StateError::LockPoisoned.to_string(), "ledger lock poisoned");
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(StateError::Io(inner).to_string().contains("i/o"));
    }
}
