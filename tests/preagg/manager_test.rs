//! Integration tests for the pre-aggregation manager.
//!
//! Backend capabilities (rewriter, converter, export service) and the cache
//! engine are mocked so the tests exercise orchestration: pipeline isolation,
//! the refresh guard, teardown, recurring refresh and export cleanup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use stratum::config::Settings;
use stratum::engine::{CacheEngine, EngineError, EngineResult, QueryStream, Value};
use stratum::manifest::{Manifest, PreAggregationDefinition, SchemaKey, SessionContext};
use stratum::planner::{
    Connector, DialectConverter, ExportService, PlanError, PlanResult, QueryRewriter,
};
use stratum::preagg::{ExportLocation, PreAggregationError, PreAggregationManager, TaskStatus};

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

struct StaticRewriter;

#[async_trait]
impl QueryRewriter for StaticRewriter {
    async fn rewrite(
        &self,
        sql: &str,
        _context: &SessionContext,
        _manifest: &Manifest,
    ) -> PlanResult<String> {
        Ok(format!("SELECT * FROM ({sql})"))
    }
}

/// Fails conversion for queries containing `fail_convert`.
struct MarkerConverter;

#[async_trait]
impl DialectConverter for MarkerConverter {
    async fn convert(&self, sql: &str, _context: &SessionContext) -> PlanResult<String> {
        if sql.contains("fail_convert") {
            Err(PlanError::Convert("unsupported expression".to_string()))
        } else {
            Ok(sql.to_string())
        }
    }
}

#[derive(Default)]
struct MockExport {
    /// Location handed out by `materialize`; `None` means the backend
    /// materialized server-side.
    location: Option<ExportLocation>,
    released: Mutex<Vec<ExportLocation>>,
    materialize_calls: Mutex<usize>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MockExport {
    fn with_location(path: &str) -> Self {
        Self {
            location: Some(ExportLocation::new(path, "*.parquet")),
            ..Default::default()
        }
    }

    fn release_count(&self, location: &ExportLocation) -> usize {
        self.released
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l == location)
            .count()
    }

    fn calls(&self) -> usize {
        *self.materialize_calls.lock().unwrap()
    }

    /// Block `materialize` until the returned sender flips to true.
    fn install_gate(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl ExportService for MockExport {
    async fn materialize(
        &self,
        _catalog: &str,
        _schema: &str,
        _name: &str,
        _native_sql: &str,
    ) -> PlanResult<Option<ExportLocation>> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }
        *self.materialize_calls.lock().unwrap() += 1;
        Ok(self.location.clone())
    }

    async fn release(&self, location: &ExportLocation) -> PlanResult<()> {
        self.released.lock().unwrap().push(location.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MockEngine {
    ddl: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
    fail_loads: bool,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MockEngine {
    fn failing_loads() -> Self {
        Self {
            fail_loads: true,
            ..Default::default()
        }
    }

    fn ddl_statements(&self) -> Vec<String> {
        self.ddl.lock().unwrap().clone()
    }

    fn dropped_tables(&self) -> Vec<String> {
        self.dropped.lock().unwrap().clone()
    }

    /// Block `execute_ddl` until the returned sender flips to true.
    fn install_gate(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl CacheEngine for MockEngine {
    async fn execute_ddl(&self, sql: &str) -> EngineResult<()> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }
        self.ddl.lock().unwrap().push(sql.to_string());
        if self.fail_loads {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    async fn drop_table_quietly(&self, table: &str) {
        self.dropped.lock().unwrap().push(table.to_string());
    }

    async fn query(&self, _sql: &str, _params: Vec<Value>) -> EngineResult<QueryStream> {
        let (_tx, stream) = QueryStream::channel(Vec::new());
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_settings() -> Settings {
    Settings::from_toml(
        r#"
        [storage]
        load_template = "LOAD '{path}/{pattern}' INTO \"{table}\""
        "#,
    )
    .unwrap()
}

fn build_manager(
    engine: Arc<MockEngine>,
    export: Arc<MockExport>,
    settings: &Settings,
) -> Arc<PreAggregationManager> {
    let connector = Connector::new(Arc::new(StaticRewriter), Arc::new(MarkerConverter), export);
    PreAggregationManager::new(engine, connector, settings)
}

fn manifest(definitions: &[(&str, &str, u64)]) -> Arc<Manifest> {
    Arc::new(Manifest {
        catalog: "sales".to_string(),
        schema: "analytics".to_string(),
        pre_aggregations: definitions
            .iter()
            .map(|(name, query, secs)| {
                PreAggregationDefinition::new(*name, *query, Duration::from_secs(*secs))
            })
            .collect(),
    })
}

fn key(name: &str) -> SchemaKey {
    SchemaKey::new("sales", "analytics", name)
}

async fn wait_for_task_done(manager: &PreAggregationManager, task_id: &str) {
    for _ in 0..200 {
        if let Some(task) = manager.get_task(task_id) {
            if task.status == TaskStatus::Done {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never completed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_mixed_outcome_cycle() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/mixed"));
    let manager = build_manager(engine.clone(), export, &test_settings());
    let manifest = manifest(&[
        ("good", "SELECT * FROM good_model", 60),
        ("bad", "SELECT fail_convert FROM bad_model", 60),
    ]);

    let task = manager.create_task_and_wait(&manifest).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.outcomes.len(), 2);

    let good = manager.table_mapping().get(&key("good")).unwrap();
    assert!(good.is_ready());
    assert!(good.error().is_none());

    let bad = manager.table_mapping().get(&key("bad")).unwrap();
    assert!(bad.table_name().is_none());
    assert!(!bad.error().unwrap().is_empty());

    // The failed pipeline dropped its partially built table quietly.
    assert!(!engine.dropped_tables().is_empty());
}

#[tokio::test]
async fn test_binding_has_exactly_one_side_after_cycle() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/one-side"));
    let manager = build_manager(engine, export, &test_settings());
    let manifest = manifest(&[
        ("a", "SELECT * FROM a", 60),
        ("b", "SELECT fail_convert FROM b", 60),
        ("c", "SELECT * FROM c", 60),
    ]);

    let task = manager.create_task_and_wait(&manifest).await.unwrap();
    for outcome in &task.outcomes {
        assert!(
            outcome.table_name.is_some() ^ outcome.error.is_some(),
            "outcome for {} must have exactly one of table/error",
            outcome.name
        );
    }
}

#[tokio::test]
async fn test_refresh_while_running_fails_and_leaves_mapping() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/guard"));
    let manager = build_manager(engine, export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    let gate = export.install_gate();
    let running = manager.create_task(&manifest).await.unwrap();
    assert_eq!(running.status, TaskStatus::Running);

    let before = manager.table_mapping().entries_for_schema("sales", "analytics");
    let err = manager.refresh(&manifest).await.unwrap_err();
    assert!(matches!(err, PreAggregationError::AlreadyRunning { .. }));
    let after = manager.table_mapping().entries_for_schema("sales", "analytics");
    assert_eq!(before.len(), after.len());

    // Only the original task exists; the rejected refresh did not queue.
    assert_eq!(manager.list_tasks(None, None, None).len(), 1);

    gate.send_replace(true);
    wait_for_task_done(&manager, &running.id).await;
}

#[tokio::test]
async fn test_second_refresh_in_quick_succession_fails() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/race"));
    let manager = build_manager(engine, export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    let gate = export.install_gate();
    manager.refresh(&manifest).await.unwrap();
    let second = manager.refresh(&manifest).await;
    assert!(matches!(
        second,
        Err(PreAggregationError::AlreadyRunning { .. })
    ));

    gate.send_replace(true);
}

#[tokio::test]
async fn test_refresh_allowed_after_previous_cycle_completes() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/serial"));
    let manager = build_manager(engine, export, &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    manager.create_task_and_wait(&manifest).await.unwrap();
    // DONE task no longer blocks the guard.
    manager.create_task_and_wait(&manifest).await.unwrap();
    assert_eq!(manager.list_tasks(None, None, None).len(), 2);
}

#[tokio::test]
async fn test_remove_schema_clears_everything() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/teardown"));
    let manager = build_manager(engine.clone(), export, &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    manager.create_task_and_wait(&manifest).await.unwrap();
    assert!(manager.scheduled_refresh_exists(&key("orders")));
    let table = manager
        .table_mapping()
        .get(&key("orders"))
        .unwrap()
        .table_name()
        .unwrap()
        .to_string();

    manager.remove_schema("sales", "analytics").await;

    assert!(!manager.scheduled_refresh_exists(&key("orders")));
    assert!(manager.table_mapping().get(&key("orders")).is_none());
    assert!(engine.dropped_tables().contains(&table));

    // Idempotent on an empty schema.
    manager.remove_schema("sales", "analytics").await;
}

#[tokio::test]
async fn test_remove_schema_during_inflight_pipeline_leaves_nothing() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/inflight"));
    let manager = build_manager(engine.clone(), export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 1)]);

    // Hold the pipeline open mid-load, then tear the schema down under it.
    let gate = engine.install_gate();
    let task = manager.create_task(&manifest).await.unwrap();
    for _ in 0..200 {
        if export.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    manager.remove_schema("sales", "analytics").await;

    gate.send_replace(true);
    wait_for_task_done(&manager, &task.id).await;

    // The pipeline noticed the teardown: no schedule, no binding, and the
    // table it built was dropped.
    assert!(!manager.scheduled_refresh_exists(&key("orders")));
    assert!(manager.table_mapping().get(&key("orders")).is_none());
    assert!(engine
        .dropped_tables()
        .iter()
        .any(|table| table.starts_with("orders_")));
}

#[tokio::test]
async fn test_export_released_even_when_load_fails() {
    let engine = Arc::new(MockEngine::failing_loads());
    let export = Arc::new(MockExport::with_location("/tmp/exports/leak"));
    let manager = build_manager(engine.clone(), export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    manager.create_task_and_wait(&manifest).await.unwrap();

    let location = ExportLocation::new("/tmp/exports/leak", "*.parquet");
    assert_eq!(export.release_count(&location), 1);

    let binding = manager.table_mapping().get(&key("orders")).unwrap();
    assert!(binding.error().is_some());
    // The partially built table was dropped.
    assert!(!engine.dropped_tables().is_empty());
    // A failed initial run installs no recurring job.
    assert!(!manager.scheduled_refresh_exists(&key("orders")));
}

#[tokio::test]
async fn test_server_side_materialization_skips_load() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::default()); // materialize returns None
    let manager = build_manager(engine.clone(), export, &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    manager.create_task_and_wait(&manifest).await.unwrap();

    assert!(engine.ddl_statements().is_empty());
    assert!(manager.table_mapping().get(&key("orders")).unwrap().is_ready());
}

#[tokio::test]
async fn test_load_statement_uses_storage_template() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/fmt"));
    let manager = build_manager(engine.clone(), export, &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    manager.create_task_and_wait(&manifest).await.unwrap();

    let statements = engine.ddl_statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("LOAD '/tmp/exports/fmt/*.parquet' INTO \"orders_"));
}

#[tokio::test]
async fn test_clean_all_concurrent_with_release_one() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/concurrent"));
    let manager = build_manager(engine.clone(), export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);
    let location = ExportLocation::new("/tmp/exports/concurrent", "*.parquet");

    // Hold the load open so the export location stays tracked.
    let gate = engine.install_gate();
    let task = manager.create_task(&manifest).await.unwrap();
    for _ in 0..200 {
        if export.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let clean = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.clean_all().await })
    };
    let release = {
        let manager = manager.clone();
        let location = location.clone();
        tokio::spawn(async move { manager.release_one(&location).await })
    };
    clean.await.unwrap();
    release.await.unwrap();

    gate.send_replace(true);
    wait_for_task_done(&manager, &task.id).await;

    // Exactly one delete, no matter how the three release paths raced
    // (clean_all, release_one, the pipeline's own inline release).
    assert_eq!(export.release_count(&location), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recurring_refresh_swaps_table_and_drops_previous() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/recurring"));
    let manager = build_manager(engine.clone(), export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 1)]);

    manager.create_task_and_wait(&manifest).await.unwrap();
    let first = manager
        .table_mapping()
        .get(&key("orders"))
        .unwrap()
        .table_name()
        .unwrap()
        .to_string();
    assert!(manager.scheduled_refresh_exists(&key("orders")));

    // Let the fixed-delay schedule run at least one more materialization.
    let mut second = first.clone();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(binding) = manager.table_mapping().get(&key("orders")) {
            let current = binding.table_name().unwrap().to_string();
            if current != first {
                second = current;
                break;
            }
        }
    }
    assert_ne!(second, first, "recurring refresh never ran");
    // The superseded physical table was dropped.
    assert!(engine.dropped_tables().contains(&first));
    assert!(export.calls() >= 2);
}

#[tokio::test]
async fn test_refresh_disabled_installs_no_schedule() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/disabled"));
    let settings = Settings::from_toml(
        r#"
        [storage]
        load_template = "LOAD '{path}/{pattern}' INTO \"{table}\""

        [refresh]
        enabled = false
        "#,
    )
    .unwrap();
    let manager = build_manager(engine, export, &settings);
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    manager.create_task_and_wait(&manifest).await.unwrap();
    assert!(manager.table_mapping().get(&key("orders")).unwrap().is_ready());
    assert!(!manager.scheduled_refresh_exists(&key("orders")));
}

#[tokio::test]
async fn test_list_tasks_filters() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/filters"));
    let manager = build_manager(engine, export, &test_settings());

    let sales = manifest(&[("orders", "SELECT * FROM orders", 60)]);
    let marketing = Arc::new(Manifest {
        catalog: "marketing".to_string(),
        schema: "campaigns".to_string(),
        pre_aggregations: vec![PreAggregationDefinition::new(
            "clicks",
            "SELECT * FROM clicks",
            Duration::from_secs(60),
        )],
    });

    manager.create_task_and_wait(&sales).await.unwrap();
    manager.create_task_and_wait(&marketing).await.unwrap();

    assert_eq!(manager.list_tasks(None, None, None).len(), 2);
    assert_eq!(manager.list_tasks(Some("sales"), None, None).len(), 1);
    assert_eq!(manager.list_tasks(None, Some("campaigns"), None).len(), 1);
    assert_eq!(manager.list_tasks(None, None, Some(true)).len(), 0);
    assert_eq!(manager.list_tasks(None, None, Some(false)).len(), 2);
    assert!(manager.list_tasks(Some("nope"), None, None).is_empty());
}

#[tokio::test]
async fn test_get_task() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/get"));
    let manager = build_manager(engine, export, &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 60)]);

    let task = manager.create_task_and_wait(&manifest).await.unwrap();
    let fetched = manager.get_task(&task.id).unwrap();
    assert_eq!(fetched.status, TaskStatus::Done);
    assert_eq!(fetched.outcomes.len(), 1);

    assert!(manager.get_task("no-such-task").is_none());
}

#[tokio::test]
async fn test_shutdown_stops_schedule_and_cleans_exports() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::with_location("/tmp/exports/shutdown"));
    let manager = build_manager(engine.clone(), export.clone(), &test_settings());
    let manifest = manifest(&[("orders", "SELECT * FROM orders", 1)]);
    let location = ExportLocation::new("/tmp/exports/shutdown", "*.parquet");

    // Leave a load hanging so its export location stays tracked.
    let _gate = engine.install_gate();
    manager.create_task(&manifest).await.unwrap();
    for _ in 0..200 {
        if export.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.shutdown().await;

    assert!(!manager.scheduled_refresh_exists(&key("orders")));
    assert_eq!(export.release_count(&location), 1);
}

#[tokio::test]
async fn test_empty_manifest_cycle_completes() {
    let engine = Arc::new(MockEngine::default());
    let export = Arc::new(MockExport::default());
    let manager = build_manager(engine, export, &test_settings());
    let manifest = manifest(&[]);

    let task = manager.create_task_and_wait(&manifest).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.outcomes.is_empty());
}
