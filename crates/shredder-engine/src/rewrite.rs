//! Predicate-rewrite rules.
//!
//! Some targets store identifiers where a plain `field IN (...)` predicate
//! can't reach them. A rule recognizes one exact (target, field, source)
//! combination and supplies the full field condition used by in-place
//! deletes. Rules are looked up in registration order; the first match wins.

use shredder_types::table::{DeleteSource, DeleteTarget};

/// A registered replacement for the generated field condition.
pub trait PredicateRewrite: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Replacement field condition, or `None` if the rule does not apply.
    fn rewrite(
        &self,
        target: &DeleteTarget,
        sources: &[DeleteSource],
        source_condition: &str,
    ) -> Option<String>;
}

/// Identifier stored as a value in a repeated key/value `extra` record nested
/// inside a repeated `events` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedExtraKeyRule {
    /// `dataset.table` of the target.
    pub target_table: String,
    pub target_field: String,
    /// `dataset.table` of the source.
    pub source_table: String,
    pub source_field: String,
    /// Source column holding the raw identifier compared against the extra.
    pub source_value_column: String,
    pub extra_key: String,
}

impl NestedExtraKeyRule {
    /// Relay backend events carry the account id in `events[*].extra` under
    /// the `fxa_id` key, unhashed.
    #[must_use]
    pub fn relay_fxa_id() -> Self {
        Self {
            target_table: "relay_backend_stable.events_v1".into(),
            target_field: "events[*].extra.fxa_id".into(),
            source_table: "firefox_accounts.fxa_delete_events".into(),
            source_field: "user_id".into(),
            source_value_column: "user_id_unhashed".into(),
            extra_key: "fxa_id".into(),
        }
    }

    fn matches(&self, target: &DeleteTarget, sources: &[DeleteSource]) -> bool {
        let [field] = target.fields.as_slice() else {
            return false;
        };
        let [source] = sources else {
            return false;
        };
        target.table.dataset_table() == self.target_table
            && *field == self.target_field
            && source.table.dataset_table() == self.source_table
            && source.field == self.source_field
    }
}

impl PredicateRewrite for NestedExtraKeyRule {
    fn name(&self) -> &'static str {
        "nested_extra_key"
    }

    fn rewrite(
        &self,
        target: &DeleteTarget,
        sources: &[DeleteSource],
        source_condition: &str,
    ) -> Option<String> {
        if !self.matches(target, sources) {
            return None;
        }
        let source = &sources[0];
        let filter = std::iter::once(source_condition)
            .chain(source.conditions.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" AND ");
        Some(format!(
            "EXISTS (\
             WITH ids AS (SELECT {value} AS id FROM `{table}` WHERE {filter}) \
             SELECT 1 FROM UNNEST(events) AS e \
             JOIN UNNEST(e.extra) AS ex \
             JOIN ids ON ex.value = ids.id \
             WHERE ex.key = '{key}')",
            value = self.source_value_column,
            table = source.table.sql_id(),
            key = self.extra_key,
        ))
    }
}

/// Ordered registry of predicate rewrites.
pub struct RewriteRules {
    rules: Vec<Box<dyn PredicateRewrite>>,
}

impl std::fmt::Debug for RewriteRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.name()))
            .finish()
    }
}

impl Default for RewriteRules {
    fn default() -> Self {
        Self::empty().with(NestedExtraKeyRule::relay_fxa_id())
    }
}

impl RewriteRules {
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn with(mut self, rule: impl PredicateRewrite + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// First matching rewrite for this target, if any.
    #[must_use]
    pub fn apply(
        &self,
        target: &DeleteTarget,
        sources: &[DeleteSource],
        source_condition: &str,
    ) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            let rewritten = rule.rewrite(target, sources, source_condition)?;
            tracing::debug!(rule = rule.name(), table = %target.table, "Applied predicate rewrite");
            Some(rewritten)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shredder_types::table::TableRef;

    fn relay_target() -> DeleteTarget {
        DeleteTarget::new(
            TableRef::new("shared", "relay_backend_stable", "events_v1"),
            vec!["events[*].extra.fxa_id".into()],
        )
    }

    fn fxa_source(project: &str) -> DeleteSource {
        DeleteSource::new(
            TableRef::new(project, "firefox_accounts", "fxa_delete_events"),
            "user_id",
        )
        .with_conditions(vec!["TRUE".into()])
    }

    #[test]
    fn relay_rule_builds_exists_over_nested_extras() {
        let rules = RewriteRules::default();
        let sql = rules
            .apply(&relay_target(), &[fxa_source("shared")], "DATE(x) >= '2024-01-01'")
            .unwrap();
        assert!(sql.starts_with("EXISTS ("));
        assert!(sql.contains("SELECT user_id_unhashed AS id FROM `shared.firefox_accounts.fxa_delete_events`"));
        assert!(sql.contains("WHERE DATE(x) >= '2024-01-01' AND TRUE"));
        assert!(sql.contains("UNNEST(events) AS e"));
        assert!(sql.contains("UNNEST(e.extra) AS ex"));
        assert!(sql.contains("ex.key = 'fxa_id'"));
    }

    #[test]
    fn relay_rule_follows_source_project_override() {
        let sql = RewriteRules::default()
            .apply(&relay_target(), &[fxa_source("override")], "TRUE")
            .unwrap();
        assert!(sql.contains("`override.firefox_accounts.fxa_delete_events`"));
    }

    #[test]
    fn rule_requires_exact_match() {
        let rules = RewriteRules::default();
        let other_field = DeleteTarget::new(relay_target().table, vec!["client_id".into()]);
        assert!(rules.apply(&other_field, &[fxa_source("shared")], "TRUE").is_none());

        let other_source = DeleteSource::new(
            TableRef::new("shared", "firefox_accounts", "fxa_delete_events"),
            "user_id_unhashed",
        );
        assert!(rules.apply(&relay_target(), &[other_source], "TRUE").is_none());

        let two_sources = [fxa_source("shared"), fxa_source("shared")];
        assert!(rules.apply(&relay_target(), &two_sources, "TRUE").is_none());
    }

    #[test]
    fn empty_registry_never_rewrites() {
        assert!(RewriteRules::empty()
            .apply(&relay_target(), &[fxa_source("shared")], "TRUE")
            .is_none());
    }
}
