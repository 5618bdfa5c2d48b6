//! Pure statement builders.
//!
//! Given a target, its sources and a resolved partition, build the SQL and
//! job configuration for one deletion job. Nothing here talks to the
//! warehouse or fails; problems surface when the job runs.

use std::borrow::Cow;

use shredder_types::partition::Partition;
use shredder_types::state::DateWindow;
use shredder_types::table::{DeleteSource, DeleteTarget};
use shredder_types::warehouse::{Priority, QueryJobConfig};

use crate::rewrite::RewriteRules;

/// Number of `sample_id` shards in a sampled rewrite.
pub const SAMPLE_COUNT: u8 = 100;

/// Legacy identifier expressions that may be wrapped in curly braces.
const BRACED_EXPRESSIONS: &[&str] = &[
    "context_id",
    "payload.scalars.parent.deletion_request_context_id",
];

/// Filter applied to every source table: requests received in the window.
#[must_use]
pub fn source_condition(window: &DateWindow) -> String {
    format!(
        "DATE(submission_timestamp) >= '{}' AND DATE(submission_timestamp) < '{}'",
        window.start, window.end
    )
}

/// Strip curly braces from legacy braced identifiers before comparison.
#[must_use]
pub fn normalized_expr(expr: &str) -> Cow<'_, str> {
    if BRACED_EXPRESSIONS.contains(&expr) {
        Cow::Owned(format!("REPLACE(REPLACE({expr}, '{{', ''), '}}', '')"))
    } else {
        Cow::Borrowed(expr)
    }
}

/// Everything a statement is built from.
#[derive(Debug, Clone, Copy)]
pub struct DeletionScope<'a> {
    pub target: &'a DeleteTarget,
    pub sources: &'a [DeleteSource],
    pub partition: &'a Partition,
    pub source_condition: &'a str,
}

impl<'a> DeletionScope<'a> {
    fn source_filter(&self, source: &DeleteSource) -> String {
        std::iter::once(self.source_condition)
            .chain(source.conditions.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn pairs(&self) -> impl Iterator<Item = (usize, (&'a String, &'a DeleteSource))> + 'a {
        self.target.fields.iter().zip(self.sources).enumerate()
    }
}

/// How a partition is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionMode {
    /// `DELETE ... WHERE` against the target.
    InPlace,
    /// Rewrite the partition without the matching rows, truncating it.
    Rewrite { destination: String },
    /// Rewrite one `sample_id` shard into an intermediate table.
    SampleShard { sample_id: u8, destination: String },
}

/// Where a sample shard of `partition_id` is written.
#[must_use]
pub fn sample_destination(
    temp_dataset: &str,
    target: &DeleteTarget,
    partition_id: &str,
    sample_id: u8,
) -> String {
    format!(
        "{temp_dataset}.{}_{partition_id}__sample_{sample_id}",
        target.table.table
    )
}

/// Pick the deletion mode for a partition.
///
/// Whole-table scope must use DML so concurrent writes can't drop
/// partitions, and special partitions can't be a query destination.
#[must_use]
pub fn resolve_mode(
    target: &DeleteTarget,
    partition: &Partition,
    use_dml: bool,
    shard: Option<(u8, &str)>,
) -> DeletionMode {
    let Some(id) = partition.id.as_deref().filter(|_| !partition.is_special) else {
        return DeletionMode::InPlace;
    };
    match shard {
        Some((sample_id, temp_dataset)) => DeletionMode::SampleShard {
            sample_id,
            destination: sample_destination(temp_dataset, target, id, sample_id),
        },
        None if !use_dml => DeletionMode::Rewrite {
            destination: format!("{}${id}", target.table.sql_id()),
        },
        None => DeletionMode::InPlace,
    }
}

/// SQL plus the job configuration to run it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub config: QueryJobConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOptions {
    pub dry_run: bool,
    pub priority: Priority,
}

/// Build the statement for `mode`.
#[must_use]
pub fn build_statement(
    scope: &DeletionScope<'_>,
    mode: &DeletionMode,
    options: StatementOptions,
    rules: &RewriteRules,
    clustering_fields: Option<&[String]>,
) -> Statement {
    let config = QueryJobConfig::new(options.dry_run, options.priority);
    match mode {
        DeletionMode::InPlace => Statement {
            sql: delete_sql(scope, rules),
            config,
        },
        DeletionMode::Rewrite { destination } => Statement {
            sql: rewrite_sql(scope, None),
            config: config.overwrite(destination.as_str()),
        },
        DeletionMode::SampleShard {
            sample_id,
            destination,
        } => {
            let mut config = config.overwrite(destination.as_str());
            config.clustering_fields = clustering_fields.map(<[String]>::to_vec);
            Statement {
                sql: rewrite_sql(scope, Some(*sample_id)),
                config,
            }
        }
    }
}

fn delete_sql(scope: &DeletionScope<'_>, rules: &RewriteRules) -> String {
    let field_condition = rules
        .apply(scope.target, scope.sources, scope.source_condition)
        .unwrap_or_else(|| {
            scope
                .pairs()
                .map(|(_, (field, source))| {
                    format!(
                        "{} IN (SELECT {} FROM `{}` WHERE {})",
                        normalized_expr(field),
                        normalized_expr(&source.field),
                        source.table.sql_id(),
                        scope.source_filter(source),
                    )
                })
                .collect::<Vec<_>>()
                .join(" OR ")
        });
    format!(
        "DELETE\n  `{}`\nWHERE\n  ({field_condition})\n  AND ({})",
        scope.target.table.sql_id(),
        scope.partition.condition,
    )
}

fn rewrite_sql(scope: &DeletionScope<'_>, sample_id: Option<u8>) -> String {
    let sample_filter = sample_id
        .map(|s| format!(" AND sample_id = {s}"))
        .unwrap_or_default();
    let mut joins = String::new();
    let mut null_checks = Vec::new();
    for (index, (field, source)) in scope.pairs() {
        joins.push_str(&format!(
            "LEFT JOIN\n  (SELECT {} AS _source_{index} FROM `{}` WHERE {}{sample_filter})\n  ON {} = _source_{index}\n",
            normalized_expr(&source.field),
            source.table.sql_id(),
            scope.source_filter(source),
            normalized_expr(field),
        ));
        null_checks.push(format!("_source_{index} IS NULL"));
    }
    let field_conditions = null_checks.join(" AND ");
    let condition = &scope.partition.condition;
    let (field_conditions, partition_condition) = if scope.partition.is_whole_table() {
        // Keep rows outside the condition; still name it so partition filters are satisfied.
        (
            format!("({condition}) IS NOT TRUE OR ({field_conditions})"),
            format!("({condition}) IS NOT TRUE OR ({condition})"),
        )
    } else {
        (field_conditions, condition.clone())
    };
    let trailing_sample = sample_id
        .map(|s| format!("\n  AND sample_id = {s}"))
        .unwrap_or_default();
    format!(
        "SELECT\n  _target.*,\nFROM\n  `{}` AS _target\n{joins}WHERE\n  ({field_conditions})\n  AND ({partition_condition}){trailing_sample}",
        scope.target.table.sql_id(),
    )
}

/// Whole-partition scan used to estimate a sampled rewrite in dry runs.
#[must_use]
pub fn partition_select_sql(target: &DeleteTarget, partition: &Partition) -> String {
    format!(
        "SELECT * FROM `{}` WHERE {}",
        target.table.sql_id(),
        partition.condition
    )
}
