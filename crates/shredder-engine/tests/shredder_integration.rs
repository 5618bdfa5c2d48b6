//! End-to-end runs against the in-memory warehouse and SQLite ledgers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use shredder_engine::client_pool::ClientPool;
use shredder_engine::config::parser;
use shredder_engine::config::types::{Environment, ShredConfig, TableFilter};
use shredder_engine::config::validator;
use shredder_engine::discovery::{self, StaticTargets, TargetDiscovery};
use shredder_engine::ledger::Ledgers;
use shredder_engine::rewrite::RewriteRules;
use shredder_engine::{run_with, InMemoryWarehouse, ShredError, Warehouse};
use shredder_types::table::{DeleteSource, DeleteTarget, TableRef, TargetWithSources};
use shredder_types::warehouse::{Partitioning, TableMetadata};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn config() -> ShredConfig {
    let mut config = ShredConfig::new(date("2024-01-15"));
    config.billing_projects = vec!["billing-a".into(), "billing-b".into()];
    config.parallelism = 2;
    config.max_single_dml_bytes = 100;
    config
}

fn pool(wh: &InMemoryWarehouse, config: &ShredConfig) -> Arc<ClientPool> {
    Arc::new(
        ClientPool::round_robin(&config.billing_projects, config.parallelism, |project| -> Arc<dyn Warehouse> {
            Arc::new(wh.with_billing_project(project))
        })
        .unwrap(),
    )
}

fn events_table() -> TableRef {
    TableRef::new("p", "d", "events")
}

/// A large, daily partitioned target with five partitions before the end
/// date and one on it.
fn seed_events(wh: &InMemoryWarehouse) {
    wh.add_table(
        TableMetadata::new(events_table())
            .with_size(1_000, 10_000)
            .with_partitioning(Partitioning::Time { field: None }),
    );
    wh.add_partitions(
        &events_table(),
        ["20240110", "20240111", "20240112", "20240113", "20240114", "20240115"],
    );
}

fn events_discovery() -> StaticTargets {
    StaticTargets::new(vec![TargetWithSources {
        target: DeleteTarget::new(events_table(), vec!["user_id".into()]),
        sources: vec![DeleteSource::new(TableRef::new("p", "d", "s"), "user_id")],
    }])
}

#[tokio::test]
async fn dml_deletes_each_partition_with_source_subquery() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    wh.set_affected_rows(3);
    wh.set_default_bytes(10);
    let config = config();

    let summary = run_with(&config, &events_discovery(), pool(&wh, &config), Ledgers::default(), &RewriteRules::default())
        .await
        .unwrap();

    let executed = wh.executed_queries();
    assert_eq!(executed.len(), 5, "one job per partition before the end date");
    let newest = executed
        .iter()
        .find(|q| q.sql.contains("= '2024-01-14'"))
        .map(|q| q.sql.as_str())
        .unwrap();
    assert_eq!(
        newest,
        "DELETE\n  `p.d.events`\nWHERE\n  (user_id IN (SELECT user_id FROM `p.d.s` WHERE \
         DATE(submission_timestamp) >= '2024-01-01' AND DATE(submission_timestamp) < '2024-01-15'))\n  \
         AND (CAST(_PARTITIONTIME AS DATE) = '2024-01-14')"
    );
    assert!(executed.iter().all(|q| !q.sql.contains("= '2024-01-15'")));
    let billed: std::collections::BTreeSet<_> = executed.iter().map(|q| q.billing_project.as_str()).collect();
    assert_eq!(billed.len(), 2, "work rotates across billing projects");

    assert_eq!(summary.tasks, 5);
    assert_eq!(summary.bytes_processed, 50);
    assert_eq!(summary.rows_deleted, Some(15));
    assert_eq!(summary.tables[0].table, "p.d.events");
}

#[tokio::test]
async fn partition_limit_dry_run_touches_two_newest_partitions() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    let mut config = config();
    config.dry_run = true;
    config.partition_limit = Some(2);

    let summary = run_with(&config, &events_discovery(), pool(&wh, &config), Ledgers::default(), &RewriteRules::default())
        .await
        .unwrap();

    assert_eq!(summary.tasks, 2);
    assert!(wh.executed_queries().is_empty());
    assert_eq!(wh.jobs_created(), 0);
    let queries = wh.queries();
    assert_eq!(queries.len(), 2);
    for day in ["'2024-01-14'", "'2024-01-13'"] {
        assert!(queries.iter().any(|q| q.sql.contains(day)), "{day} not queried");
    }
    assert!(queries.iter().all(|q| q.config.dry_run));
}

struct TrackingDiscovery {
    called: AtomicBool,
}

#[async_trait]
impl TargetDiscovery for TrackingDiscovery {
    fn name(&self) -> String {
        "tracking".into()
    }

    async fn discover(&self, _warehouse: &dyn Warehouse) -> Result<Vec<TargetWithSources>, ShredError> {
        self.called.store(true, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn sampling_without_temp_dataset_fails_before_discovery() {
    let wh = InMemoryWarehouse::new("billing-a");
    let mut config = config();
    config.sampling_tables = vec!["a.b".into()];
    let discovery = TrackingDiscovery {
        called: AtomicBool::new(false),
    };

    let err = run_with(&config, &discovery, pool(&wh, &config), Ledgers::default(), &RewriteRules::default())
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert!(err.to_string().contains("--temp-dataset"), "{err}");
    assert!(!discovery.called.load(Ordering::SeqCst));
    assert!(wh.queries().is_empty());
}

#[tokio::test]
async fn unknown_sampling_table_aborts_before_planning() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    let mut config = config();
    config.sampling_tables = vec!["d.events".into(), "d.missing".into()];
    config.temp_dataset = Some("p.tmp".into());

    let err = run_with(&config, &events_discovery(), pool(&wh, &config), Ledgers::default(), &RewriteRules::default())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "1 sampling tables not found in targets: d.missing");
    assert!(wh.queries().is_empty());
}

#[tokio::test]
async fn filtered_out_targets_yield_no_tasks() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    let mut config = config();
    config.table_filter = TableFilter::new(&[], &["d.*".to_string()]).unwrap();

    let err = run_with(&config, &events_discovery(), pool(&wh, &config), Ledgers::default(), &RewriteRules::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ShredError::NoTasks));
    assert_eq!(err.to_string(), "No tables selected");
}

#[tokio::test]
async fn resumed_run_reuses_recorded_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let location = format!("sqlite:{}", dir.path().join("ledger.db").display());
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    wh.set_default_bytes(10);
    wh.set_affected_rows(1);
    let mut config = config();
    config.state_table = Some(location.clone());

    let open = |wh: &InMemoryWarehouse| {
        let client: Arc<dyn Warehouse> = Arc::new(wh.clone());
        Ledgers::open(Some(&location), None, &client).unwrap()
    };

    let first = run_with(&config, &events_discovery(), pool(&wh, &config), open(&wh), &RewriteRules::default())
        .await
        .unwrap();
    assert_eq!(wh.jobs_created(), 5);

    let second = run_with(&config, &events_discovery(), pool(&wh, &config), open(&wh), &RewriteRules::default())
        .await
        .unwrap();
    assert_eq!(wh.jobs_created(), 5, "completed jobs are not rerun");
    assert_eq!(second.bytes_processed, first.bytes_processed);
    assert_eq!(second.rows_deleted, first.rows_deleted);

    // A new end date is a new ledger scope.
    let mut later = config.clone();
    later.end_date = date("2024-01-16");
    later.start_date = date("2024-01-02");
    run_with(&later, &events_discovery(), pool(&wh, &later), open(&wh), &RewriteRules::default())
        .await
        .unwrap();
    assert_eq!(wh.jobs_created(), 11);
}

#[tokio::test]
async fn failed_task_lets_others_finish() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    wh.fail_queries_containing("'2024-01-12'", "Resources exceeded");
    let config = config();

    let err = run_with(&config, &events_discovery(), pool(&wh, &config), Ledgers::default(), &RewriteRules::default())
        .await
        .unwrap_err();

    let ShredError::TaskFailures { failed, first } = err else {
        panic!("expected task failures");
    };
    assert_eq!(failed, 1);
    assert!(first.to_string().contains("Resources exceeded"));
    assert_eq!(wh.executed_queries().len(), 5);
}

#[tokio::test]
async fn task_audit_rows_are_recorded_before_execution() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    wh.set_query_bytes("SELECT\n  user_id\nFROM\n  `p.d.s`", 64);
    let mut config = config();
    config.task_table = Some("p.shredder.tasks".into());
    let client: Arc<dyn Warehouse> = Arc::new(wh.clone());
    let ledgers = Ledgers::open(None, config.task_table.as_deref(), &client).unwrap();

    run_with(&config, &events_discovery(), pool(&wh, &config), ledgers, &RewriteRules::default())
        .await
        .unwrap();

    let rows = wh.inserted_rows(&TableRef::new("p", "shredder", "tasks"));
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0]["task_id"], "p.d.events$20240114");
    assert_eq!(rows[0]["source_bytes"], 64);
    assert_eq!(rows[0]["target_bytes"], 10_000);
    assert!(wh.table(&TableRef::new("p", "shredder", "tasks")).unwrap().is_time_partitioned());
}

#[tokio::test]
async fn dry_run_does_not_create_or_write_ledgers() {
    let wh = InMemoryWarehouse::new("billing-a");
    seed_events(&wh);
    let mut config = config();
    config.dry_run = true;
    config.state_table = Some("p.shredder.state".into());
    config.task_table = Some("p.shredder.tasks".into());
    let client: Arc<dyn Warehouse> = Arc::new(wh.clone());
    let ledgers = Ledgers::open(config.state_table.as_deref(), config.task_table.as_deref(), &client).unwrap();

    let summary = run_with(&config, &events_discovery(), pool(&wh, &config), ledgers, &RewriteRules::default())
        .await
        .unwrap();

    assert_eq!(summary.rows_deleted, None);
    assert!(wh.table(&TableRef::new("p", "shredder", "state")).is_none());
    assert!(wh.table(&TableRef::new("p", "shredder", "tasks")).is_none());
}

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures/targets.yaml")
}

#[tokio::test]
async fn fixture_targets_drive_discovery() {
    std::env::set_var("SHREDDER_ACCOUNTS_PROJECT", "accounts");
    let file = parser::parse_targets(&fixture_path()).expect("fixture parses");
    std::env::remove_var("SHREDDER_ACCOUNTS_PROJECT");
    validator::validate_targets(&file).expect("fixture is valid");

    let wh = InMemoryWarehouse::new("billing-a");
    wh.add_table(
        TableMetadata::new(TableRef::new("experiments", "analysis", "enrollments_a"))
            .with_columns(["client_id"]),
    );
    wh.add_table(TableMetadata::new(TableRef::new("experiments", "analysis", "statistics_a")));

    let found = discovery::for_environment(&file, Environment::Experiments, &[])
        .unwrap()
        .discover(&wh)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].target.table.sql_id(), "experiments.analysis.enrollments_a");
    assert_eq!(
        found[0].sources[0].table.sql_id(),
        "shared.telemetry_stable.deletion_request_v4"
    );

    let telemetry = &file.environments[&Environment::Telemetry];
    assert_eq!(
        telemetry.targets[2].sources[0].table,
        "accounts.firefox_accounts.fxa_delete_events"
    );
}
