//! Partition resolver.
//!
//! Decides which slices of a target table a run processes. Small tables and
//! unpartitioned tables are handled as a single whole-table partition; large
//! partitioned tables are enumerated partition by partition, never touching
//! dates on or after the run's end date.

use chrono::NaiveDate;
use shredder_types::partition::{Partition, NULL_PARTITION_ID, OUTSIDE_RANGE_PARTITION_ID};
use shredder_types::warehouse::{Partitioning, TableMetadata};

use crate::errors::ShredError;
use crate::warehouse::Warehouse;

/// Partition ids of time-partitioned tables use this format.
const PARTITION_DATE_FMT: &str = "%Y%m%d";

/// SQL expression for the table's partitioning column, if it has one.
#[must_use]
pub fn partition_expr(table: &TableMetadata) -> Option<String> {
    match &table.partitioning {
        Some(Partitioning::Range { field, .. }) => Some(field.clone()),
        Some(Partitioning::Time { field }) => Some(format!(
            "CAST({} AS DATE)",
            field.as_deref().unwrap_or("_PARTITIONTIME")
        )),
        None => None,
    }
}

fn invalid(table: &TableMetadata, id: &str, reason: impl Into<String>) -> ShredError {
    ShredError::InvalidPartitionId {
        table: table.table.sql_id(),
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Resolve one partition id (or the whole table when `id` is `None`).
///
/// Returns `Ok(None)` for partitions that must not be processed: dates on or
/// after `end_date`, and the streaming buffer of time-partitioned tables.
///
/// # Errors
///
/// Returns [`ShredError::InvalidPartitionId`] if the id can't be parsed for
/// the table's partitioning.
pub fn resolve_partition(
    table: &TableMetadata,
    expr: Option<&str>,
    end_date: NaiveDate,
    id: Option<&str>,
) -> Result<Option<Partition>, ShredError> {
    let Some(id) = id else {
        return Ok(Some(match expr {
            Some(expr) if table.is_time_partitioned() => {
                Partition::whole_table(format!("{expr} < '{end_date}'"))
            }
            _ => Partition::whole_table("TRUE"),
        }));
    };
    let Some(expr) = expr else {
        return Err(invalid(table, id, "table is not partitioned"));
    };

    match &table.partitioning {
        Some(Partitioning::Time { field }) => {
            if id == NULL_PARTITION_ID {
                let column = field.as_deref().unwrap_or("_PARTITIONTIME");
                return Ok(Some(Partition::special(format!("{column} IS NULL"), id)));
            }
            if id == OUTSIDE_RANGE_PARTITION_ID {
                tracing::warn!(
                    table = %table.table,
                    "Skipping streaming buffer partition {OUTSIDE_RANGE_PARTITION_ID}"
                );
                return Ok(None);
            }
            let date = NaiveDate::parse_from_str(id, PARTITION_DATE_FMT)
                .map_err(|e| invalid(table, id, e.to_string()))?;
            if date < end_date {
                Ok(Some(Partition::new(format!("{expr} = '{date}'"), id)))
            } else {
                Ok(None)
            }
        }
        Some(Partitioning::Range {
            start,
            end,
            interval,
            ..
        }) => {
            if id == NULL_PARTITION_ID {
                return Ok(Some(Partition::special(format!("{expr} IS NULL"), id)));
            }
            if id == OUTSIDE_RANGE_PARTITION_ID {
                return Ok(Some(Partition::special(
                    format!("{expr} < {start} OR {expr} >= {end}"),
                    id,
                )));
            }
            let lower: i64 = id
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(table, id, e.to_string()))?;
            if *interval > 1 {
                let upper = lower.saturating_add(interval - 1);
                Ok(Some(Partition::new(
                    format!("{expr} BETWEEN {lower} AND {upper}"),
                    id,
                )))
            } else {
                Ok(Some(Partition::new(format!("{expr} = {lower}"), id)))
            }
        }
        None => Err(invalid(table, id, "table is not partitioned")),
    }
}

/// Resolve a listing of partition ids, or the whole table when `ids` is
/// `None`, then apply the optional partition limit.
///
/// The limit keeps the `limit` highest partition ids.
///
/// # Errors
///
/// Propagates [`resolve_partition`] errors.
pub fn select_partitions(
    table: &TableMetadata,
    end_date: NaiveDate,
    ids: Option<&[String]>,
    partition_limit: Option<usize>,
) -> Result<Vec<Partition>, ShredError> {
    let expr = partition_expr(table);
    let mut partitions = Vec::new();
    match ids {
        Some(ids) => {
            for id in ids {
                if let Some(partition) =
                    resolve_partition(table, expr.as_deref(), end_date, Some(id))?
                {
                    partitions.push(partition);
                }
            }
        }
        None => partitions.extend(resolve_partition(table, expr.as_deref(), end_date, None)?),
    }
    if let Some(limit) = partition_limit.filter(|limit| *limit > 0) {
        partitions.sort_by(|a, b| b.id.cmp(&a.id));
        partitions.truncate(limit);
    }
    Ok(partitions)
}

/// Returns `true` when `table` must be processed partition by partition.
#[must_use]
pub fn needs_partition_listing(table: &TableMetadata, max_single_dml_bytes: u64) -> bool {
    table.num_bytes.unwrap_or(0) > max_single_dml_bytes && partition_expr(table).is_some()
}

/// List the partitions of `table` to process in this run.
///
/// # Errors
///
/// Returns warehouse errors from the catalog query or partition resolution
/// errors.
pub async fn list_partitions(
    warehouse: &dyn Warehouse,
    table: &TableMetadata,
    end_date: NaiveDate,
    max_single_dml_bytes: u64,
    partition_limit: Option<usize>,
) -> Result<Vec<Partition>, ShredError> {
    if needs_partition_listing(table, max_single_dml_bytes) {
        let ids = warehouse.list_partition_ids(&table.table).await?;
        tracing::debug!(table = %table.table, partitions = ids.len(), "Listed partitions");
        select_partitions(table, end_date, Some(&ids), partition_limit)
    } else {
        select_partitions(table, end_date, None, partition_limit)
    }
}
