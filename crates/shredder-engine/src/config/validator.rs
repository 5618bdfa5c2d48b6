//! Semantic validation of run options and target definitions.

use globset::Glob;
use shredder_types::table::TableRef;

use crate::config::types::{EnvironmentTargets, ScanConfig, ScanSource, ShredConfig, TargetsFile};
use crate::errors::ShredError;

fn finish(errors: Vec<String>) -> Result<(), ShredError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ShredError::InvalidConfig(errors))
    }
}

/// Validate run options before any warehouse access.
///
/// # Errors
///
/// Returns [`ShredError::InvalidConfig`] listing every problem found.
pub fn validate_config(config: &ShredConfig) -> Result<(), ShredError> {
    let mut errors = Vec::new();

    if config.partition_limit.is_some() && !config.dry_run {
        errors.push("--partition-limit specified without --dry-run".to_string());
    }
    if !config.sampling_tables.is_empty() && config.temp_dataset.is_none() {
        errors.push("--temp-dataset must be specified when using --sampling-tables".to_string());
    }
    if let Some(temp_dataset) = &config.temp_dataset {
        let parts: Vec<&str> = temp_dataset.split('.').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.trim().is_empty()) {
            errors.push(format!(
                "--temp-dataset '{temp_dataset}' must be in project.dataset format"
            ));
        }
    }
    for table in &config.sampling_tables {
        let parts: Vec<&str> = table.split('.').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.trim().is_empty()) {
            errors.push(format!(
                "sampling table '{table}' must be in dataset.table format"
            ));
        }
    }
    if config.parallelism == 0 {
        errors.push("--parallelism must be > 0".to_string());
    }
    if config.sampling_parallelism == 0 {
        errors.push("--sampling-parallelism must be > 0".to_string());
    }
    if config.start_date > config.end_date {
        errors.push(format!(
            "--start-date {} is after --end-date {}",
            config.start_date, config.end_date
        ));
    }
    if config.billing_projects.is_empty() {
        errors.push("at least one billing project is required".to_string());
    }
    if config.billing_projects.iter().any(|p| p.trim().is_empty()) {
        errors.push("billing projects must not be empty".to_string());
    }

    finish(errors)
}

fn check_table(raw: &str, context: &str, errors: &mut Vec<String>) {
    match TableRef::parse(raw, None) {
        Ok(_) => {}
        Err(e) => errors.push(format!("{context}: {e}")),
    }
}

fn check_scan(scan: &ScanConfig, context: &str, errors: &mut Vec<String>) {
    for (name, pattern) in std::iter::once(("datasets", &scan.datasets))
        .chain(std::iter::once(("tables", &scan.tables)))
        .chain(scan.exclude_tables.iter().map(|p| ("exclude_tables", p)))
    {
        if let Err(e) = Glob::new(pattern) {
            errors.push(format!("{context}: invalid {name} pattern '{pattern}': {e}"));
        }
    }
    if scan.field.trim().is_empty() {
        errors.push(format!("{context}: field must not be empty"));
    }
    match &scan.source {
        ScanSource::SameDataset {
            same_dataset_table,
            field,
            ..
        } => {
            if same_dataset_table.contains('.') {
                errors.push(format!(
                    "{context}: same_dataset_table '{same_dataset_table}' must be a bare table name"
                ));
            }
            if field.trim().is_empty() {
                errors.push(format!("{context}: source field must not be empty"));
            }
        }
        ScanSource::Fixed(source) => {
            check_table(&source.table, &format!("{context} source"), errors);
        }
    }
}

fn check_environment(name: &str, env: &EnvironmentTargets, errors: &mut Vec<String>) {
    for (i, target) in env.targets.iter().enumerate() {
        let context = format!("{name} target {i} ({})", target.table);
        check_table(&target.table, &context, errors);
        if target.fields.is_empty() {
            errors.push(format!("{context}: at least one field is required"));
        }
        if target.fields.len() != target.sources.len() {
            errors.push(format!(
                "{context}: {} field(s) but {} source(s), sources match fields by position",
                target.fields.len(),
                target.sources.len()
            ));
        }
        for source in &target.sources {
            check_table(&source.table, &format!("{context} source"), errors);
            if source.field.trim().is_empty() {
                errors.push(format!("{context}: source field must not be empty"));
            }
        }
    }
    for (i, scan) in env.scans.iter().enumerate() {
        let context = format!("{name} scan {i}");
        if scan.project.trim().is_empty() {
            errors.push(format!("{context}: project is required"));
        }
        check_scan(scan, &context, errors);
    }
    if let Some(scan) = &env.study_scan {
        check_scan(scan, &format!("{name} study_scan"), errors);
    }
}

/// Validate every environment of a targets file.
///
/// # Errors
///
/// Returns [`ShredError::InvalidConfig`] listing every problem found.
pub fn validate_targets(file: &TargetsFile) -> Result<(), ShredError> {
    let mut errors = Vec::new();
    for (environment, targets) in &file.environments {
        check_environment(environment.as_str(), targets, &mut errors);
    }
    finish(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::config::parser::parse_targets_str;

    fn config() -> ShredConfig {
        ShredConfig::new(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
    }

    fn errors(result: Result<(), ShredError>) -> Vec<String> {
        match result {
            Err(ShredError::InvalidConfig(errors)) => errors,
            other => panic!("expected config errors, got {other:?}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&config()).is_ok());
    }

    #[test]
    fn partition_limit_requires_dry_run() {
        let mut c = config();
        c.partition_limit = Some(2);
        assert_eq!(
            errors(validate_config(&c)),
            vec!["--partition-limit specified without --dry-run"]
        );
        c.dry_run = true;
        assert!(validate_config(&c).is_ok());
    }

    #[test]
    fn sampling_requires_temp_dataset() {
        let mut c = config();
        c.sampling_tables = vec!["a.b".into()];
        assert_eq!(
            errors(validate_config(&c)),
            vec!["--temp-dataset must be specified when using --sampling-tables"]
        );
    }

    #[test]
    fn all_problems_are_collected() {
        let mut c = config();
        c.parallelism = 0;
        c.sampling_parallelism = 0;
        c.start_date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        c.billing_projects.clear();
        c.temp_dataset = Some("just_a_dataset".into());
        c.sampling_tables = vec!["p.d.t".into()];
        let errs = errors(validate_config(&c));
        assert_eq!(errs.len(), 6, "{errs:?}");
        assert!(errs.iter().any(|e| e.contains("project.dataset")));
        assert!(errs.iter().any(|e| e.contains("is after")));
    }

    #[test]
    fn targets_field_source_mismatch() {
        let file = parse_targets_str(
            r"
environments:
  telemetry:
    targets:
      - table: p.d.t
        fields: [a, b]
        sources:
          - table: p.d.s
            field: a
",
        )
        .unwrap();
        let errs = errors(validate_targets(&file));
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("2 field(s) but 1 source(s)"), "{errs:?}");
    }

    #[test]
    fn scans_need_project_and_valid_globs() {
        let file = parse_targets_str(
            r"
environments:
  experiments:
    scans:
      - datasets: 'analysis[' 
        field: client_id
        source:
          same_dataset_table: other.requests
          field: client_id
",
        )
        .unwrap();
        let errs = errors(validate_targets(&file));
        assert_eq!(errs.len(), 3, "{errs:?}");
    }

    #[test]
    fn study_scan_may_omit_project() {
        let file = parse_targets_str(
            r"
environments:
  pioneer:
    study_scan:
      datasets: '*'
      field: rally_id
      source:
        same_dataset_table: deletion_request_v1
        field: rally_id
",
        )
        .unwrap();
        assert!(validate_targets(&file).is_ok());
    }
}
