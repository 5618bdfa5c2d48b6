//! Table identifiers and deletion target/source definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error produced when a table identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableRefError {
    #[error("table id '{0}' must be project.dataset.table or dataset.table")]
    Malformed(String),
    #[error("table id '{0}' has no project and no default project was given")]
    MissingProject(String),
}

/// Fully qualified warehouse table: `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parse `project.dataset.table`, `project:dataset.table` or, when a
    /// default project is supplied, `dataset.table`. Surrounding backticks
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TableRefError`] when the identifier does not have the
    /// expected number of components.
    pub fn parse(raw: &str, default_project: Option<&str>) -> Result<Self, TableRefError> {
        let trimmed = raw.trim().trim_matches('`');
        let normalized = trimmed.replacen(':', ".", 1);
        let parts: Vec<&str> = normalized.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(TableRefError::Malformed(raw.to_string()));
        }
        match parts.as_slice() {
            [project, dataset, table] => Ok(Self::new(*project, *dataset, *table)),
            [dataset, table] => default_project.map_or_else(
                || Err(TableRefError::MissingProject(raw.to_string())),
                |project| Ok(Self::new(project, *dataset, *table)),
            ),
            _ => Err(TableRefError::Malformed(raw.to_string())),
        }
    }

    /// `project.dataset.table`, as used inside backticks in standard SQL.
    #[must_use]
    pub fn sql_id(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// `dataset.table`, the project-independent name used for filters and
    /// sampling configuration.
    #[must_use]
    pub fn dataset_table(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }

    /// Copy of this reference living in another project.
    #[must_use]
    pub fn with_project(&self, project: &str) -> Self {
        Self::new(project, self.dataset.clone(), self.table.clone())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// A table containing user identifiers that must be erased.
///
/// `fields` lists the column paths holding identifiers; each field is matched
/// positionally against one [`DeleteSource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteTarget {
    pub table: TableRef,
    pub fields: Vec<String>,
}

impl DeleteTarget {
    #[must_use]
    pub fn new(table: TableRef, fields: Vec<String>) -> Self {
        Self { table, fields }
    }

    #[must_use]
    pub fn with_project(&self, project: &str) -> Self {
        Self {
            table: self.table.with_project(project),
            fields: self.fields.clone(),
        }
    }
}

/// A table enumerating identifiers that requested deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeleteSource {
    pub table: TableRef,
    pub field: String,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl DeleteSource {
    #[must_use]
    pub fn new(table: TableRef, field: impl Into<String>) -> Self {
        Self {
            table,
            field: field.into(),
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_conditions(mut self, conditions: Vec<String>) -> Self {
        self.conditions = conditions;
        self
    }

    #[must_use]
    pub fn with_project(&self, project: &str) -> Self {
        Self {
            table: self.table.with_project(project),
            field: self.field.clone(),
            conditions: self.conditions.clone(),
        }
    }
}

/// A target paired with the sources it is deleted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetWithSources {
    pub target: DeleteTarget,
    pub sources: Vec<DeleteSource>,
}
