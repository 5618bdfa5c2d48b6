//! Targets file parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::TargetsFile;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Replace every `${VAR_NAME}` with the value of that environment variable.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(substituted.into_owned())
}

/// Parse targets YAML (after env var substitution).
///
/// # Errors
///
/// Returns an error if substitution fails or the YAML does not match the
/// targets file layout.
pub fn parse_targets_str(yaml: &str) -> Result<TargetsFile> {
    let substituted = substitute_env_vars(yaml)?;
    serde_yaml::from_str(&substituted).context("Failed to parse targets YAML")
}

/// Read and parse a targets file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or fails to parse.
pub fn parse_targets(path: &Path) -> Result<TargetsFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read targets file: {}", path.display()))?;
    parse_targets_str(&content)
        .with_context(|| format!("Invalid targets file: {}", path.display()))
}
