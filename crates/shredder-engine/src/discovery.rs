//! Target discovery.
//!
//! Every environment resolves to a list of `(target, sources)` pairs through
//! [`TargetDiscovery`]. Fixed definitions come from the targets file; scans
//! enumerate datasets in the warehouse at run time.

use std::collections::HashSet;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use shredder_types::table::{DeleteSource, DeleteTarget, TableRef, TargetWithSources};

use crate::config::types::{
    Environment, ScanConfig, ScanSource, SourceConfig, TargetConfig, TargetsFile,
};
use crate::errors::ShredError;
use crate::warehouse::Warehouse;

/// A source of `(target, sources)` pairs.
#[async_trait]
pub trait TargetDiscovery: Send + Sync {
    /// Short description used in log messages.
    fn name(&self) -> String;

    /// # Errors
    ///
    /// Returns [`ShredError`] if the warehouse can't be listed or a
    /// definition is malformed.
    async fn discover(&self, warehouse: &dyn Warehouse) -> Result<Vec<TargetWithSources>, ShredError>;
}

fn source_from_config(config: &SourceConfig) -> Result<DeleteSource, ShredError> {
    Ok(DeleteSource::new(TableRef::parse(&config.table, None)?, config.field.clone())
        .with_conditions(config.conditions.clone()))
}

/// Targets listed verbatim in the targets file.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets {
    targets: Vec<TargetWithSources>,
}

impl StaticTargets {
    #[must_use]
    pub fn new(targets: Vec<TargetWithSources>) -> Self {
        Self { targets }
    }

    /// # Errors
    ///
    /// Returns [`ShredError::Table`] for a malformed table id.
    pub fn from_config(configs: &[TargetConfig]) -> Result<Self, ShredError> {
        let targets = configs
            .iter()
            .map(|config| {
                Ok(TargetWithSources {
                    target: DeleteTarget::new(
                        TableRef::parse(&config.table, None)?,
                        config.fields.clone(),
                    ),
                    sources: config
                        .sources
                        .iter()
                        .map(source_from_config)
                        .collect::<Result<_, ShredError>>()?,
                })
            })
            .collect::<Result<_, ShredError>>()?;
        Ok(Self { targets })
    }
}

#[async_trait]
impl TargetDiscovery for StaticTargets {
    fn name(&self) -> String {
        format!("{} static target(s)", self.targets.len())
    }

    async fn discover(&self, _warehouse: &dyn Warehouse) -> Result<Vec<TargetWithSources>, ShredError> {
        Ok(self.targets.clone())
    }
}

fn matcher(pattern: &str) -> Result<GlobMatcher, ShredError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ShredError::InvalidConfig(vec![format!("invalid pattern '{pattern}': {e}")]))
}

/// Every matching table in the matching datasets of one project.
#[derive(Debug, Clone)]
pub struct DatasetScan {
    project: String,
    datasets: GlobMatcher,
    tables: GlobMatcher,
    exclude: GlobSet,
    field: String,
    source: ScanSource,
}

impl DatasetScan {
    /// # Errors
    ///
    /// Returns [`ShredError::InvalidConfig`] for an invalid glob.
    pub fn new(scan: &ScanConfig) -> Result<Self, ShredError> {
        Self::for_project(scan, &scan.project)
    }

    /// The scan run against `project` instead of the configured one.
    ///
    /// # Errors
    ///
    /// Returns [`ShredError::InvalidConfig`] for an invalid glob.
    pub fn for_project(scan: &ScanConfig, project: &str) -> Result<Self, ShredError> {
        let mut exclude = GlobSetBuilder::new();
        for pattern in &scan.exclude_tables {
            exclude.add(Glob::new(pattern).map_err(|e| {
                ShredError::InvalidConfig(vec![format!("invalid pattern '{pattern}': {e}")])
            })?);
        }
        Ok(Self {
            project: project.to_string(),
            datasets: matcher(&scan.datasets)?,
            tables: matcher(&scan.tables)?,
            exclude: exclude
                .build()
                .map_err(|e| ShredError::InvalidConfig(vec![e.to_string()]))?,
            field: scan.field.clone(),
            source: scan.source.clone(),
        })
    }

    /// Resolve the source for `dataset`, or `None` when the dataset has no
    /// deletion requests table.
    async fn source_for(
        &self,
        warehouse: &dyn Warehouse,
        dataset: &str,
    ) -> Result<Option<DeleteSource>, ShredError> {
        match &self.source {
            ScanSource::Fixed(config) => source_from_config(config).map(Some),
            ScanSource::SameDataset {
                same_dataset_table,
                field,
                conditions,
            } => {
                let table = TableRef::new(self.project.as_str(), dataset, same_dataset_table.as_str());
                if warehouse.get_table(&table).await?.is_none() {
                    tracing::debug!(dataset = %dataset, "Skipping dataset without {same_dataset_table}");
                    return Ok(None);
                }
                Ok(Some(
                    DeleteSource::new(table, field.clone()).with_conditions(conditions.clone()),
                ))
            }
        }
    }

    fn top_level_column(&self) -> &str {
        self.field.split('.').next().unwrap_or(&self.field)
    }
}

#[async_trait]
impl TargetDiscovery for DatasetScan {
    fn name(&self) -> String {
        format!("scan of {} datasets matching {}", self.project, self.datasets.glob())
    }

    async fn discover(&self, warehouse: &dyn Warehouse) -> Result<Vec<TargetWithSources>, ShredError> {
        let mut found = Vec::new();
        let mut datasets = warehouse.list_datasets(&self.project).await?;
        datasets.sort();
        for dataset in datasets.iter().filter(|d| self.datasets.is_match(d.as_str())) {
            let Some(source) = self.source_for(warehouse, dataset).await? else {
                continue;
            };
            let mut tables = warehouse.list_tables(&self.project, dataset).await?;
            tables.sort();
            for table in tables {
                if !self.tables.is_match(&table) || self.exclude.is_match(&table) {
                    continue;
                }
                let table_ref = TableRef::new(self.project.as_str(), dataset.as_str(), table.as_str());
                if table_ref == source.table {
                    continue;
                }
                let Some(meta) = warehouse.get_table(&table_ref).await? else {
                    continue;
                };
                if !meta.columns.is_empty() && !meta.has_column(self.top_level_column()) {
                    tracing::debug!(table = %table_ref, field = %self.field, "Skipping table without id field");
                    continue;
                }
                found.push(TargetWithSources {
                    target: DeleteTarget::new(table_ref, vec![self.field.clone()]),
                    sources: vec![source.clone()],
                });
            }
        }
        Ok(found)
    }
}

/// Concatenation of several discoveries. A target found more than once is
/// kept at its first occurrence.
#[derive(Default)]
pub struct CompositeDiscovery {
    parts: Vec<Box<dyn TargetDiscovery>>,
}

impl CompositeDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, part: impl TargetDiscovery + 'static) -> Self {
        self.parts.push(Box::new(part));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[async_trait]
impl TargetDiscovery for CompositeDiscovery {
    fn name(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn discover(&self, warehouse: &dyn Warehouse) -> Result<Vec<TargetWithSources>, ShredError> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        for part in &self.parts {
            let found = part.discover(warehouse).await?;
            tracing::debug!(discovery = %part.name(), targets = found.len(), "Discovered targets");
            for pair in found {
                if seen.insert(pair.target.table.sql_id()) {
                    all.push(pair);
                } else {
                    tracing::debug!(table = %pair.target.table, "Ignoring duplicate target");
                }
            }
        }
        Ok(all)
    }
}

/// Build the discovery for `environment` from the targets file.
///
/// Pioneer study projects each run the environment's `study_scan`.
///
/// # Errors
///
/// Returns [`ShredError::Discovery`] when the environment has no entry, or
/// definition errors.
pub fn for_environment(
    file: &TargetsFile,
    environment: Environment,
    study_projects: &[String],
) -> Result<CompositeDiscovery, ShredError> {
    let config = file.environments.get(&environment).ok_or_else(|| {
        ShredError::Discovery(format!("no targets configured for environment {environment}"))
    })?;

    let mut discovery = CompositeDiscovery::new().with(StaticTargets::from_config(&config.targets)?);
    for scan in &config.scans {
        discovery = discovery.with(DatasetScan::new(scan)?);
    }
    match &config.study_scan {
        Some(scan) => {
            if study_projects.is_empty() {
                tracing::warn!("No study projects given, skipping {environment} study scan");
            }
            for project in study_projects {
                discovery = discovery.with(DatasetScan::for_project(scan, project)?);
            }
        }
        None if !study_projects.is_empty() => {
            tracing::warn!("Environment {environment} has no study_scan, ignoring study projects");
        }
        None => {}
    }
    Ok(discovery)
}
