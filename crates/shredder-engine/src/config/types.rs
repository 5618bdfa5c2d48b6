//! Run options and the targets file model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use shredder_types::state::DateWindow;
use shredder_types::warehouse::Priority;

use crate::errors::ShredError;

pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_SAMPLING_PARALLELISM: usize = 10;
pub const DEFAULT_BILLING_PROJECT: &str = "moz-fx-data-bq-batch-prod";
/// 10 TiB.
pub const DEFAULT_MAX_SINGLE_DML_BYTES: u64 = 10 * (1 << 40);
pub const DEFAULT_LOOKBACK_DAYS: i64 = 14;

/// Deployment whose targets are processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Telemetry,
    Pioneer,
    Experiments,
}

impl Environment {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Pioneer => "pioneer",
            Self::Experiments => "experiments",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telemetry" => Ok(Self::Telemetry),
            "pioneer" => Ok(Self::Pioneer),
            "experiments" => Ok(Self::Experiments),
            other => Err(format!(
                "unknown environment '{other}', expected telemetry, pioneer or experiments"
            )),
        }
    }
}

/// `--only` / `--except` glob filter over `dataset.table` names.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    only: Option<GlobSet>,
    except: Option<GlobSet>,
}

fn compile(patterns: &[String]) -> Result<Option<GlobSet>, ShredError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    let mut errors = Vec::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => errors.push(format!("invalid table pattern '{pattern}': {e}")),
        }
    }
    if !errors.is_empty() {
        return Err(ShredError::InvalidConfig(errors));
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| ShredError::InvalidConfig(vec![format!("invalid table patterns: {e}")]))
}

impl TableFilter {
    /// # Errors
    ///
    /// Returns [`ShredError::InvalidConfig`] listing every invalid pattern.
    pub fn new(only: &[String], except: &[String]) -> Result<Self, ShredError> {
        Ok(Self {
            only: compile(only)?,
            except: compile(except)?,
        })
    }

    /// Whether `dataset_table` passes the filter.
    #[must_use]
    pub fn matches(&self, dataset_table: &str) -> bool {
        let included = self
            .only
            .as_ref()
            .map_or(true, |set| set.is_match(dataset_table));
        let excluded = self
            .except
            .as_ref()
            .is_some_and(|set| set.is_match(dataset_table));
        included && !excluded
    }
}

/// Options for one shredder run.
#[derive(Debug, Clone)]
pub struct ShredConfig {
    pub environment: Environment,
    pub dry_run: bool,
    /// Delete ordinary partitions with DML instead of rewriting them.
    pub use_dml: bool,
    pub parallelism: usize,
    pub sampling_parallelism: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub billing_projects: Vec<String>,
    pub source_project: Option<String>,
    pub target_project: Option<String>,
    pub max_single_dml_bytes: u64,
    pub priority: Priority,
    pub state_table: Option<String>,
    pub task_table: Option<String>,
    /// `dataset.table` names processed one sample id at a time.
    pub sampling_tables: Vec<String>,
    pub temp_dataset: Option<String>,
    pub partition_limit: Option<usize>,
    pub pioneer_study_projects: Vec<String>,
    pub table_filter: TableFilter,
}

impl ShredConfig {
    /// Defaults for a run ending at `end_date`, looking back two weeks.
    #[must_use]
    pub fn new(end_date: NaiveDate) -> Self {
        Self {
            environment: Environment::default(),
            dry_run: false,
            use_dml: true,
            parallelism: DEFAULT_PARALLELISM,
            sampling_parallelism: DEFAULT_SAMPLING_PARALLELISM,
            start_date: default_start_date(end_date),
            end_date,
            billing_projects: vec![DEFAULT_BILLING_PROJECT.to_string()],
            source_project: None,
            target_project: None,
            max_single_dml_bytes: DEFAULT_MAX_SINGLE_DML_BYTES,
            priority: Priority::default(),
            state_table: None,
            task_table: None,
            sampling_tables: Vec::new(),
            temp_dataset: None,
            partition_limit: None,
            pioneer_study_projects: Vec::new(),
            table_filter: TableFilter::default(),
        }
    }

    #[must_use]
    pub fn window(&self) -> DateWindow {
        DateWindow::new(self.start_date, self.end_date)
    }

    #[must_use]
    pub fn is_sampling_table(&self, dataset_table: &str) -> bool {
        self.sampling_tables.iter().any(|t| t == dataset_table)
    }
}

#[must_use]
pub fn default_start_date(end_date: NaiveDate) -> NaiveDate {
    end_date - Duration::days(DEFAULT_LOOKBACK_DAYS)
}

// ---------------------------------------------------------------------------
// Targets file
// ---------------------------------------------------------------------------

/// Parsed targets file: discovery settings per environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsFile {
    #[serde(default)]
    pub environments: BTreeMap<Environment, EnvironmentTargets>,
}

/// Discovery settings for one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentTargets {
    /// Fixed target definitions.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Dataset scans run against the warehouse at discovery time.
    #[serde(default)]
    pub scans: Vec<ScanConfig>,
    /// Scan repeated for every `--pioneer-study-projects` entry, with the
    /// study project substituted for the scan project.
    #[serde(default)]
    pub study_scan: Option<ScanConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// `project.dataset.table`
    pub table: String,
    pub fields: Vec<String>,
    /// One source per field, matched by position.
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub table: String,
    pub field: String,
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// Targets every matching table in the matching datasets of a project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    #[serde(default)]
    pub project: String,
    /// Glob over dataset names.
    pub datasets: String,
    /// Glob over table names.
    #[serde(default = "default_table_glob")]
    pub tables: String,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    /// Identifier field in each target. Tables without its top-level column
    /// are skipped.
    pub field: String,
    pub source: ScanSource,
}

fn default_table_glob() -> String {
    "*".to_string()
}

/// Where a scanned dataset's deletion requests come from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScanSource {
    /// A table in the scanned dataset itself. Datasets without it are
    /// skipped.
    SameDataset {
        same_dataset_table: String,
        field: String,
        #[serde(default)]
        conditions: Vec<String>,
    },
    /// One fixed table shared by every scanned dataset.
    Fixed(SourceConfig),
}
