//! Task descriptors, planning and ordering.
//!
//! A [`Task`] binds one target partition to the statement plan that deletes
//! from it. Planning is pure apart from reading table metadata and listing
//! partitions; execution lives in [`crate::execution`].

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::NaiveDate;
use shredder_types::partition::Partition;
use shredder_types::state::TaskId;
use shredder_types::table::{DeleteSource, DeleteTarget};
use shredder_types::warehouse::{Priority, TableMetadata};

use crate::errors::ShredError;
use crate::partition::list_partitions;
use crate::query::{
    build_statement, partition_select_sql, resolve_mode, DeletionScope, Statement,
    StatementOptions, SAMPLE_COUNT,
};
use crate::rewrite::RewriteRules;
use crate::warehouse::Warehouse;

/// Planning inputs shared by every target of a run.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub dry_run: bool,
    pub use_dml: bool,
    pub priority: Priority,
    pub end_date: NaiveDate,
    pub max_single_dml_bytes: u64,
    pub partition_limit: Option<usize>,
    pub source_condition: String,
    pub sampling_parallelism: usize,
    pub temp_dataset: Option<String>,
}

/// One shard of a sampled rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleShard {
    pub sample_id: u8,
    pub task_id: TaskId,
    pub statement: Statement,
}

/// Sharded rewrite merged back into the partition by a copy job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledPlan {
    pub shards: Vec<SampleShard>,
    /// `project.dataset.table$partition` receiving the merged shards.
    pub merge_destination: String,
    /// Dry-run byte estimate used instead of the copy.
    pub estimate_sql: String,
    pub parallelism: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPlan {
    Single(Statement),
    Sampled(SampledPlan),
}

/// Unit of deletion work for one (target, partition) pair.
#[derive(Debug, Clone)]
pub struct Task {
    pub target: DeleteTarget,
    pub table: Arc<TableMetadata>,
    pub sources: Vec<DeleteSource>,
    pub partition: Partition,
    pub task_id: TaskId,
    pub plan: TaskPlan,
}

impl Task {
    /// Ordering key; tasks run in descending key order.
    ///
    /// Whole-table tasks sort first, then tables without time partitioning,
    /// then partitions by descending id.
    #[must_use]
    pub fn sort_key(&self) -> (bool, bool, Option<&str>) {
        (
            self.partition.id.is_none(),
            !self.table.is_time_partitioned(),
            self.partition.id.as_deref(),
        )
    }

    /// Fully qualified id of the target table.
    #[must_use]
    pub fn table_id(&self) -> String {
        self.table.table.sql_id()
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        matches!(self.plan, TaskPlan::Sampled(_))
    }
}

/// Sort into dispatch order: table id ascending, then [`Task::sort_key`]
/// descending. Both passes are stable so the order is total and repeatable.
pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by_cached_key(Task::table_id);
    tasks.sort_by(|a, b| compare_keys(b, a));
}

fn compare_keys(a: &Task, b: &Task) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

/// Build the task for one resolved partition.
#[must_use]
pub fn build_task(
    target: &DeleteTarget,
    table: &Arc<TableMetadata>,
    sources: &[DeleteSource],
    partition: Partition,
    use_sampling: bool,
    options: &PlanOptions,
    rules: &RewriteRules,
) -> Task {
    let task_id = TaskId::for_table(&target.table, partition.id.as_deref());
    let statement_options = StatementOptions {
        dry_run: options.dry_run,
        priority: options.priority,
    };
    let scope = DeletionScope {
        target,
        sources,
        partition: &partition,
        source_condition: &options.source_condition,
    };

    let sampled = use_sampling && !partition.is_special && !partition.is_whole_table();
    if use_sampling && !sampled {
        tracing::warn!(
            "Cannot use sampling on full table deletion, {} is too small to use sampling",
            target.table.dataset_table()
        );
    }

    let plan = match (&partition.id, options.temp_dataset.as_deref()) {
        (Some(partition_id), Some(temp_dataset)) if sampled => {
            let shards = (0..SAMPLE_COUNT)
                .map(|sample_id| {
                    let mode = resolve_mode(
                        target,
                        &partition,
                        options.use_dml,
                        Some((sample_id, temp_dataset)),
                    );
                    SampleShard {
                        sample_id,
                        task_id: task_id.sample(sample_id),
                        statement: build_statement(
                            &scope,
                            &mode,
                            statement_options,
                            rules,
                            table.clustering_fields.as_deref(),
                        ),
                    }
                })
                .collect();
            TaskPlan::Sampled(SampledPlan {
                shards,
                merge_destination: format!("{}${partition_id}", target.table.sql_id()),
                estimate_sql: partition_select_sql(target, &partition),
                parallelism: options.sampling_parallelism.max(1),
            })
        }
        _ => {
            let mode = resolve_mode(target, &partition, options.use_dml, None);
            TaskPlan::Single(build_statement(&scope, &mode, statement_options, rules, None))
        }
    };

    Task {
        target: target.clone(),
        table: Arc::clone(table),
        sources: sources.to_vec(),
        partition,
        task_id,
        plan,
    }
}

/// Plan every task for one target.
///
/// A target whose table does not exist is logged and yields no tasks.
///
/// # Errors
///
/// Returns warehouse errors from metadata or partition listing, and
/// partition resolution errors.
pub async fn plan_target(
    warehouse: &dyn Warehouse,
    target: &DeleteTarget,
    sources: &[DeleteSource],
    use_sampling: bool,
    options: &PlanOptions,
    rules: &RewriteRules,
) -> Result<Vec<Task>, ShredError> {
    let Some(table) = warehouse.get_table(&target.table).await? else {
        tracing::warn!("Skipping {} because the table was not found", target.table);
        return Ok(Vec::new());
    };
    let table = Arc::new(table);
    let partitions = list_partitions(
        warehouse,
        &table,
        options.end_date,
        options.max_single_dml_bytes,
        options.partition_limit,
    )
    .await?;
    tracing::debug!(
        table = %target.table,
        partitions = partitions.len(),
        sampled = use_sampling,
        "Planned target"
    );
    Ok(partitions
        .into_iter()
        .map(|partition| build_task(target, &table, sources, partition, use_sampling, options, rules))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::InMemoryWarehouse;
    use shredder_types::partition::NULL_PARTITION_ID;
    use shredder_types::table::TableRef;
    use shredder_types::warehouse::Partitioning;

    fn options() -> PlanOptions {
        PlanOptions {
            dry_run: false,
            use_dml: true,
            priority: Priority::Interactive,
            end_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            max_single_dml_bytes: 1_000,
            partition_limit: None,
            source_condition: "C".into(),
            sampling_parallelism: 10,
            temp_dataset: Some("tmp.scratch".into()),
        }
    }

    fn target(table: &str) -> DeleteTarget {
        DeleteTarget::new(TableRef::new("p", "d", table), vec!["client_id".into()])
    }

    fn sources() -> Vec<DeleteSource> {
        vec![DeleteSource::new(TableRef::new("p", "d", "src"), "client_id")]
    }

    fn time_table(name: &str) -> Arc<TableMetadata> {
        Arc::new(
            TableMetadata::new(TableRef::new("p", "d", name))
                .with_partitioning(Partitioning::Time {
                    field: Some("ts".into()),
                })
                .with_clustering(vec!["sample_id".into()]),
        )
    }

    fn task(name: &str, partition: Partition, time_partitioned: bool) -> Task {
        let table = if time_partitioned {
            time_table(name)
        } else {
            Arc::new(TableMetadata::new(TableRef::new("p", "d", name)))
        };
        build_task(
            &target(name),
            &table,
            &sources(),
            partition,
            false,
            &options(),
            &RewriteRules::empty(),
        )
    }

    fn ids(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.task_id.to_string()).collect()
    }

    #[test]
    fn sort_puts_whole_tables_first_then_unpartitioned_then_recent_partitions() {
        let mut tasks = vec![
            task("b", Partition::new("c", "20240101"), true),
            task("a", Partition::new("c", "20240102"), true),
            task("z", Partition::whole_table("TRUE"), false),
            task("c", Partition::new("c", "5"), false),
            task("a", Partition::new("c", "20240101"), true),
            task("y", Partition::whole_table("TRUE"), true),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(
            ids(&tasks),
            vec![
                "p.d.z",
                "p.d.y",
                "p.d.c$5",
                "p.d.a$20240102",
                "p.d.a$20240101",
                "p.d.b$20240101",
            ]
        );
    }

    #[test]
    fn sort_is_repeatable() {
        let build = || {
            vec![
                task("b", Partition::whole_table("TRUE"), true),
                task("a", Partition::whole_table("TRUE"), true),
                task("c", Partition::new("c", "20240101"), true),
            ]
        };
        let mut first = build();
        let mut second = build();
        second.reverse();
        sort_tasks(&mut first);
        sort_tasks(&mut second);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(ids(&first)[..2], ["p.d.a", "p.d.b"]);
    }

    #[test]
    fn sampled_partition_has_one_hundred_shards() {
        let table = time_table("t");
        let task = build_task(
            &target("t"),
            &table,
            &sources(),
            Partition::new("CAST(ts AS DATE) = '2024-01-01'", "20240101"),
            true,
            &options(),
            &RewriteRules::empty(),
        );
        let TaskPlan::Sampled(plan) = &task.plan else {
            panic!("expected sampled plan");
        };
        assert_eq!(plan.shards.len(), 100);
        assert_eq!(plan.merge_destination, "p.d.t$20240101");
        assert_eq!(plan.parallelism, 10);
        assert_eq!(
            plan.estimate_sql,
            "SELECT * FROM `p.d.t` WHERE CAST(ts AS DATE) = '2024-01-01'"
        );
        let last = &plan.shards[99];
        assert_eq!(last.task_id.as_str(), "p.d.t$20240101__sample_99");
        assert_eq!(
            last.statement.config.destination.as_deref(),
            Some("tmp.scratch.t_20240101__sample_99")
        );
        assert_eq!(
            last.statement.config.clustering_fields,
            Some(vec!["sample_id".to_string()])
        );
    }

    #[test]
    fn sampling_falls_back_for_special_and_whole_table_partitions() {
        let table = time_table("t");
        for partition in [
            Partition::special("ts IS NULL", NULL_PARTITION_ID),
            Partition::whole_table("TRUE"),
        ] {
            let task = build_task(
                &target("t"),
                &table,
                &sources(),
                partition,
                true,
                &options(),
                &RewriteRules::empty(),
            );
            assert!(!task.is_sampled());
            let TaskPlan::Single(statement) = &task.plan else {
                panic!("expected single statement");
            };
            assert!(statement.sql.starts_with("DELETE"));
        }
    }

    #[test]
    fn no_use_dml_rewrites_ordinary_partitions() {
        let mut opts = options();
        opts.use_dml = false;
        let task = build_task(
            &target("t"),
            &time_table("t"),
            &sources(),
            Partition::new("c", "20240101"),
            false,
            &opts,
            &RewriteRules::empty(),
        );
        let TaskPlan::Single(statement) = &task.plan else {
            panic!("expected single statement");
        };
        assert_eq!(statement.config.destination.as_deref(), Some("p.d.t$20240101"));
    }

    #[tokio::test]
    async fn missing_table_yields_no_tasks() {
        let wh = InMemoryWarehouse::new("billing");
        let tasks = plan_target(&wh, &target("gone"), &sources(), false, &options(), &RewriteRules::empty())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn large_table_is_planned_per_partition() {
        let wh = InMemoryWarehouse::new("billing");
        let meta = TableMetadata::new(TableRef::new("p", "d", "t"))
            .with_partitioning(Partitioning::Time {
                field: Some("ts".into()),
            })
            .with_size(100, 5_000);
        wh.add_table(meta.clone());
        wh.add_partitions(&meta.table, ["20240110", "20240114", "20240115", NULL_PARTITION_ID]);
        let tasks = plan_target(&wh, &target("t"), &sources(), false, &options(), &RewriteRules::empty())
            .await
            .unwrap();
        assert_eq!(
            ids(&tasks),
            vec!["p.d.t$20240110", "p.d.t$20240114", "p.d.t$__NULL__"]
        );
        assert!(tasks[2].partition.is_special);
    }
}
