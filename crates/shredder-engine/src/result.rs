//! Run result types.

use serde::Serialize;

use crate::execution::JobOutcome;

/// Totals for one target table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub tasks: usize,
    pub bytes_processed: u64,
    /// Not reported for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_deleted: Option<u64>,
}

/// Result of a shredder run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub tasks: usize,
    /// Per-table totals in dispatch order of each table's first task.
    pub tables: Vec<TableSummary>,
    pub bytes_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_deleted: Option<u64>,
    pub duration_secs: f64,
}

impl RunSummary {
    /// Aggregate `(table, outcome)` pairs. Missing metrics count as zero.
    #[must_use]
    pub fn from_outcomes<'a, I>(dry_run: bool, outcomes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a JobOutcome)>,
    {
        let mut summary = Self {
            dry_run,
            rows_deleted: (!dry_run).then_some(0),
            ..Self::default()
        };
        for (table, outcome) in outcomes {
            let index = match summary.tables.iter().position(|t| t.table == table) {
                Some(index) => index,
                None => {
                    summary.tables.push(TableSummary {
                        table: table.to_string(),
                        rows_deleted: (!dry_run).then_some(0),
                        ..TableSummary::default()
                    });
                    summary.tables.len() - 1
                }
            };
            let entry = &mut summary.tables[index];
            let bytes = outcome.total_bytes_processed.unwrap_or(0);
            entry.tasks += 1;
            entry.bytes_processed += bytes;
            summary.tasks += 1;
            summary.bytes_processed += bytes;
            if !dry_run {
                let rows = outcome.num_dml_affected_rows.unwrap_or(0);
                entry.rows_deleted = entry.rows_deleted.map(|r| r + rows);
                summary.rows_deleted = summary.rows_deleted.map(|r| r + rows);
            }
        }
        summary
    }

    /// Log per-table and total figures.
    pub fn log(&self) {
        for table in &self.tables {
            match table.rows_deleted {
                Some(rows) if !self.dry_run => tracing::info!(
                    "Scanned {} bytes and deleted {rows} rows from {}",
                    table.bytes_processed,
                    table.table
                ),
                _ => tracing::info!(
                    "Would scan {} bytes from {}",
                    table.bytes_processed,
                    table.table
                ),
            }
        }
        match self.rows_deleted {
            Some(rows) if !self.dry_run => tracing::info!(
                "Scanned {} and deleted {rows} rows in total",
                self.bytes_processed
            ),
            _ => tracing::info!("Would scan {} in total", self.bytes_processed),
        }
    }
}
