//! Warehouse metadata and job model types.
//!
//! These mirror the subset of the warehouse API the engine needs: table
//! metadata for partition planning, job configuration for queries and copies,
//! and the terminal state of a job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::table::TableRef;

// ---------------------------------------------------------------------------
// Table metadata
// ---------------------------------------------------------------------------

/// How a table is partitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Partitioning {
    /// Time-unit or ingestion-time partitioning. `field == None` means the
    /// pseudo column `_PARTITIONTIME`.
    Time { field: Option<String> },
    /// Integer-range partitioning over `[start, end)` in buckets of `interval`.
    Range {
        field: String,
        start: i64,
        end: i64,
        interval: i64,
    },
}

/// Metadata for a single warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table: TableRef,
    pub num_bytes: Option<u64>,
    pub num_rows: Option<u64>,
    pub partitioning: Option<Partitioning>,
    pub clustering_fields: Option<Vec<String>>,
    /// Top-level column names.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl TableMetadata {
    #[must_use]
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            num_bytes: None,
            num_rows: None,
            partitioning: None,
            clustering_fields: None,
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_size(mut self, num_rows: u64, num_bytes: u64) -> Self {
        self.num_rows = Some(num_rows);
        self.num_bytes = Some(num_bytes);
        self
    }

    #[must_use]
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    #[must_use]
    pub fn with_clustering(mut self, fields: Vec<String>) -> Self {
        self.clustering_fields = Some(fields);
        self
    }

    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn is_time_partitioned(&self) -> bool {
        matches!(self.partitioning, Some(Partitioning::Time { .. }))
    }
}

/// Column definition used when creating ledger tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: String,
}

impl FieldSpec {
    #[must_use]
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
        }
    }
}

/// Definition of a table to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: TableRef,
    pub fields: Vec<FieldSpec>,
    /// Day-partition by ingestion time.
    pub time_partitioned: bool,
}

// ---------------------------------------------------------------------------
// Job configuration
// ---------------------------------------------------------------------------

/// Scheduling priority for query jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    #[default]
    Interactive,
    Batch,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "INTERACTIVE",
            Self::Batch => "BATCH",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INTERACTIVE" => Ok(Self::Interactive),
            "BATCH" => Ok(Self::Batch),
            other => Err(format!("unknown priority '{other}', expected INTERACTIVE or BATCH")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteTruncate,
    WriteAppend,
    WriteEmpty,
}

impl WriteDisposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WriteTruncate => "WRITE_TRUNCATE",
            Self::WriteAppend => "WRITE_APPEND",
            Self::WriteEmpty => "WRITE_EMPTY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateDisposition {
    CreateIfNeeded,
    CreateNever,
}

impl CreateDisposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateIfNeeded => "CREATE_IF_NEEDED",
            Self::CreateNever => "CREATE_NEVER",
        }
    }
}

/// Configuration for a query job.
///
/// `destination` is a table id, optionally with a `$partition` decorator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJobConfig {
    pub dry_run: bool,
    pub priority: Priority,
    pub use_legacy_sql: bool,
    pub destination: Option<String>,
    pub write_disposition: Option<WriteDisposition>,
    pub clustering_fields: Option<Vec<String>>,
}

impl QueryJobConfig {
    #[must_use]
    pub fn new(dry_run: bool, priority: Priority) -> Self {
        Self {
            dry_run,
            priority,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    /// Overwrite `destination` with the query result.
    #[must_use]
    pub fn overwrite(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self.write_disposition = Some(WriteDisposition::WriteTruncate);
        self
    }

    /// Returns `true` when the job mutates its source rather than writing a
    /// separate destination.
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        self.destination.is_none()
    }
}

/// Configuration for a table copy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyJobConfig {
    pub write_disposition: WriteDisposition,
    pub create_disposition: CreateDisposition,
}

impl Default for CopyJobConfig {
    fn default() -> Self {
        Self {
            write_disposition: WriteDisposition::WriteTruncate,
            create_disposition: CreateDisposition::CreateIfNeeded,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Error produced when a full job id cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid full job id '{0}', expected project:location.job_id")]
pub struct JobIdError(pub String);

/// Reference to a warehouse job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub project: String,
    pub location: Option<String>,
    pub job_id: String,
}

impl JobRef {
    #[must_use]
    pub fn new(project: impl Into<String>, location: Option<String>, job_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            location,
            job_id: job_id.into(),
        }
    }

    /// `project:location.job_id`, or `project:job_id` without a location.
    #[must_use]
    pub fn full_id(&self) -> String {
        match &self.location {
            Some(location) => format!("{}:{}.{}", self.project, location, self.job_id),
            None => format!("{}:{}", self.project, self.job_id),
        }
    }

    /// Parse a full job id produced by [`JobRef::full_id`].
    ///
    /// # Errors
    ///
    /// Returns [`JobIdError`] if the string has no `project:` prefix or an
    /// empty job id.
    pub fn parse_full_id(raw: &str) -> Result<Self, JobIdError> {
        // Domain-scoped projects (`example.com:proj`) carry their own colon.
        let (project, rest) = raw
            .rsplit_once(':')
            .ok_or_else(|| JobIdError(raw.to_string()))?;
        if project.is_empty() || rest.is_empty() {
            return Err(JobIdError(raw.to_string()));
        }
        let (location, job_id) = match rest.split_once('.') {
            Some((location, job_id)) => (Some(location.to_string()), job_id),
            None => (None, rest),
        };
        if job_id.is_empty() || location.as_deref() == Some("") {
            return Err(JobIdError(raw.to_string()));
        }
        Ok(Self::new(project, location, job_id))
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Query,
    Copy,
}

/// Snapshot of a warehouse job.
///
/// Dry-run jobs have no persisted reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub reference: Option<JobRef>,
    pub kind: JobKind,
    pub created: DateTime<Utc>,
    /// The job reached a terminal state.
    pub ended: bool,
    /// Engine-level errors recorded on the job.
    pub errors: Vec<String>,
    pub destination: Option<String>,
    pub total_bytes_processed: Option<u64>,
    pub num_dml_affected_rows: Option<u64>,
}

impl Job {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Job id without project and location, if the job was persisted.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.reference.as_ref().map(|r| r.job_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_job_id_roundtrip_with_location() {
        let job = JobRef::new("billing", Some("US".into()), "abc123");
        assert_eq!(job.full_id(), "billing:US.abc123");
        assert_eq!(JobRef::parse_full_id("billing:US.abc123").unwrap(), job);
    }

    #[test]
    fn full_job_id_without_location() {
        let job = JobRef::parse_full_id("billing:abc123").unwrap();
        assert_eq!(job.location, None);
        assert_eq!(job.job_id, "abc123");
    }

    #[test]
    fn full_job_id_with_domain_scoped_project() {
        let job = JobRef::parse_full_id("google.com:proj:US.abc123").unwrap();
        assert_eq!(job.project, "google.com:proj");
        assert_eq!(job.location.as_deref(), Some("US"));
        assert_eq!(job.job_id, "abc123");
        assert_eq!(job.full_id(), "google.com:proj:US.abc123");
    }

    #[test]
    fn full_job_id_rejects_malformed() {
        assert!(JobRef::parse_full_id("no-colon").is_err());
        assert!(JobRef::parse_full_id(":US.abc").is_err());
        assert!(JobRef::parse_full_id("p:US.").is_err());
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("batch".parse::<Priority>().unwrap(), Priority::Batch);
        assert_eq!("INTERACTIVE".parse::<Priority>().unwrap(), Priority::Interactive);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn overwrite_sets_truncate() {
        let config = QueryJobConfig::new(false, Priority::Batch).overwrite("p.d.t$20240101");
        assert_eq!(config.destination.as_deref(), Some("p.d.t$20240101"));
        assert_eq!(config.write_disposition, Some(WriteDisposition::WriteTruncate));
        assert!(!config.is_in_place());
    }

    #[test]
    fn partitioning_serde_is_tagged() {
        let json = serde_json::to_string(&Partitioning::Time { field: None }).unwrap();
        assert_eq!(json, r#"{"type":"time","field":null}"#);
    }
}
