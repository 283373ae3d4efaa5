use async_trait::async_trait;
use chrono::Utc;
use pricing_query_engine::backends::{BackendOutput, BackendRequest, SqliteBackend, TableSchema, WarehouseSettings};
use pricing_query_engine::cache::{Clock, DiskCache, ManualClock, ResultCache};
use pricing_query_engine::config::{BackendConfig, CacheConfig, EngineConfig, LimitsConfig};
use pricing_query_engine::core::Dialect;
use pricing_query_engine::executor::ExecutionLimits;
use pricing_query_engine::generator::FallbackGenerator;
use pricing_query_engine::{
    BackendError, ErrorKind, ExecuteOptions, QueryBackend, QueryEngine, QueryExecutor, QueryRequest, QuerySource,
    SafetyValidator, Value,
};
use pricing_query_engine::metrics::MetricsLog;
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CURRENT_PRICE_QUESTION: &str = "What is the current price for identifier '123456'?";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn seed_database(dir: &Path) -> PathBuf {
    let db = dir.join("pricing.db");
    let conn = Connection::open(&db).unwrap();
    conn.execute_batch(
        "CREATE TABLE pricing_data (
            product_id TEXT NOT NULL, product_name TEXT, category TEXT, zone TEXT,
            current_price REAL, cost REAL, currency TEXT, last_updated TEXT
        );
        CREATE TABLE price_history (product_id TEXT, zone TEXT, price REAL, effective_date TEXT);
        CREATE TABLE sales_data (product_id TEXT, zone TEXT, sale_date TEXT, units_sold INTEGER, revenue REAL);
        CREATE TABLE elasticity_data (product_id TEXT, zone TEXT, elasticity REAL, r_squared REAL, computed_at TEXT);
        CREATE TABLE competitor_prices (product_id TEXT, competitor_name TEXT, competitor_price REAL, zone TEXT, observed_at TEXT);
        CREATE TABLE t (id INTEGER);

        INSERT INTO pricing_data VALUES
            ('123456', 'Kettle', 'home', 'NORTH', 19.99, 11.00, 'USD', '2026-10-01'),
            ('222222', 'Toaster', 'home', 'SOUTH', 34.50, 20.00, 'USD', '2026-10-02'),
            ('333333', 'Headphones', 'electronics', 'EAST', 89.00, 52.00, 'USD', '2026-10-03'),
            ('444444', 'Puzzle', 'toys', 'WEST', 12.00, 5.50, 'USD', '2026-10-04'),
            ('555555', 'Lamp', 'home', 'NORTH', 45.00, 30.00, 'USD', '2026-10-05');
        INSERT INTO competitor_prices VALUES
            ('123456', 'Acme', 18.49, 'NORTH', '2026-10-01');
        INSERT INTO t VALUES (1);",
    )
    .unwrap();
    db
}

/// Delegates to SQLite while recording every statement it is asked to run
struct RecordingBackend {
    inner: SqliteBackend,
    calls: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

impl RecordingBackend {
    fn new(db: &Path) -> Self {
        Self {
            inner: SqliteBackend::new(db),
            calls: AtomicUsize::new(0),
            statements: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryBackend for RecordingBackend {
    async fn execute(&self, request: &BackendRequest) -> Result<BackendOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().unwrap().push(request.sql.clone());
        self.inner.execute(request).await
    }

    async fn describe_table(&self, table: &str) -> Result<TableSchema, BackendError> {
        self.inner.describe_table(table).await
    }

    async fn list_tables(&self) -> Result<Vec<String>, BackendError> {
        self.inner.list_tables().await
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.inner.health_check().await
    }
}

struct Harness {
    _dir: TempDir,
    db: PathBuf,
    backend: Arc<RecordingBackend>,
    clock: Arc<ManualClock>,
    engine: QueryEngine,
}

async fn harness(ttl: Duration, limits: ExecutionLimits) -> Harness {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db = seed_database(dir.path());
    let backend = Arc::new(RecordingBackend::new(&db));
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let cache = DiskCache::open_with_clock(dir.path().join("cache"), ttl, 100, clock.clone())
        .await
        .unwrap();
    let executor = QueryExecutor::new(
        backend.clone(),
        Some(Arc::new(cache)),
        SafetyValidator::new(Dialect::Sqlite, 4),
        Arc::new(MetricsLog::new(100)),
        limits,
    );
    let engine = QueryEngine::new(executor, FallbackGenerator::default(), 0.6);

    Harness {
        _dir: dir,
        db,
        backend,
        clock,
        engine,
    }
}

#[tokio::test]
async fn test_current_price_scenario() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let response = h.engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;

    assert_eq!(response.source, QuerySource::Fallback);
    let generated = response.generated.as_ref().unwrap();
    assert_eq!(generated.pattern_matched.as_deref(), Some("current_price_lookup"));
    assert!(generated.confidence >= 0.85);

    let result = &response.result;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["product_id"], Value::from("123456"));
    assert_eq!(result.rows[0]["current_price"], Value::Float(19.99));
    assert_eq!(result.metadata.annotations["pattern"], "current_price_lookup");
}

#[tokio::test]
async fn test_repeated_question_is_served_from_cache() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let first = h.engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;
    let second = h.engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;

    assert!(!first.result.cache_hit);
    assert!(second.result.cache_hit);
    assert_eq!(first.result.rows, second.result.rows);
    assert_eq!(first.query_text, second.query_text);
    assert_eq!(h.backend.calls(), 1);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.total_queries, 2);
    assert!((metrics.cache_hit_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_ttl_expiry_boundary() {
    let h = harness(Duration::from_secs(60), ExecutionLimits::default()).await;
    let request = || QueryRequest::new(CURRENT_PRICE_QUESTION);

    h.engine.ask(request()).await;

    h.clock.advance(Duration::from_secs(59));
    assert!(h.engine.ask(request()).await.result.cache_hit);

    h.clock.advance(Duration::from_secs(1));
    let expired = h.engine.ask(request()).await;
    assert!(!expired.result.cache_hit);
    assert_eq!(h.backend.calls(), 2);
}

#[tokio::test]
async fn test_maintenance_sweeps_expired_entries() {
    let h = harness(Duration::from_secs(60), ExecutionLimits::default()).await;
    h.engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;
    h.engine.ask(QueryRequest::new("cheapest 3 products")).await;
    assert_eq!(h.engine.cache_stats().await.unwrap().total_entries, 2);

    h.clock.advance(Duration::from_secs(120));
    assert_eq!(h.engine.maintain_cache().await, 2);
    assert_eq!(h.engine.cache_stats().await.unwrap().total_entries, 0);
}

#[tokio::test]
async fn test_injected_statement_never_reaches_backend() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let direct = h
        .engine
        .executor()
        .execute("SELECT * FROM t; DROP TABLE t;", &ExecuteOptions::default())
        .await;
    assert_eq!(direct.error_kind(), Some(ErrorKind::Validation));
    assert!(direct
        .metadata
        .violations
        .iter()
        .any(|v| v.contains("multiple statements")));
    assert_eq!(h.backend.calls(), 0);

    // As a candidate it is rejected and replaced by the fallback query
    let response = h
        .engine
        .ask(QueryRequest::new(CURRENT_PRICE_QUESTION).with_candidate("SELECT * FROM t; DROP TABLE t;", 0.99))
        .await;
    assert_eq!(response.source, QuerySource::Fallback);
    assert!(!response.rejected_violations.is_empty());
    assert!(response.result.success);

    let statements = h.backend.statements.lock().unwrap().clone();
    assert_eq!(statements.len(), 1);
    assert!(!statements[0].contains("DROP"));

    let conn = Connection::open(&h.db).unwrap();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_mutating_candidates_rejected() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    for candidate in [
        "DELETE FROM pricing_data WHERE product_id = '123456'",
        "UPDATE pricing_data SET current_price = 0",
        "DROP TABLE pricing_data",
        "INSERT INTO pricing_data (product_id) VALUES ('x')",
    ] {
        let response = h
            .engine
            .ask(QueryRequest::new("current price for sku 123456").with_candidate(candidate, 0.95))
            .await;
        assert_eq!(response.source, QuerySource::Fallback, "{}", candidate);
        assert!(!response.rejected_violations.is_empty(), "{}", candidate);
    }

    let statements = h.backend.statements.lock().unwrap().clone();
    assert!(statements.iter().all(|s| s.starts_with("SELECT")));
}

#[tokio::test]
async fn test_benign_candidate_is_executed() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let response = h
        .engine
        .ask(
            QueryRequest::new("how many products per zone").with_candidate(
                "WITH z AS (SELECT zone FROM pricing_data) SELECT zone, COUNT(*) AS n FROM z GROUP BY zone ORDER BY zone",
                0.9,
            ),
        )
        .await;

    assert_eq!(response.source, QuerySource::Primary);
    assert!(response.result.success, "{:?}", response.result.error);
    assert_eq!(response.result.columns, vec!["zone", "n"]);
    assert_eq!(response.result.row_count, 4);
}

#[tokio::test]
async fn test_fallback_is_deterministic() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;
    let question = "which products are priced above $20 in the north";

    let a = h.engine.ask(QueryRequest::new(question)).await;
    let b = h.engine.ask(QueryRequest::new(question)).await;

    assert_eq!(a.query_text, b.query_text);
    assert_eq!(a.generated, b.generated);
    assert_eq!(a.result.rows, b.result.rows);
    assert_eq!(a.result.row_count, 1);
    assert_eq!(a.result.rows[0]["product_name"], Value::from("Lamp"));
}

#[tokio::test]
async fn test_row_limit_marks_result() {
    let limits = ExecutionLimits {
        max_rows: 2,
        ..Default::default()
    };
    let h = harness(Duration::from_secs(3600), limits).await;

    let response = h
        .engine
        .ask(QueryRequest::new("list").with_candidate("SELECT product_id FROM pricing_data", 0.9))
        .await;

    assert_eq!(response.result.row_count, 2);
    assert!(response.result.is_limited());
}

#[tokio::test]
async fn test_literal_whitespace_is_part_of_the_cache_key() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let one = h
        .engine
        .ask(QueryRequest::new("label").with_candidate("SELECT 'a b' AS label", 0.9))
        .await;
    let two = h
        .engine
        .ask(QueryRequest::new("label").with_candidate("SELECT  'a  b'  AS label", 0.9))
        .await;

    assert_eq!(one.result.rows[0]["label"], Value::from("a b"));
    assert!(!two.result.cache_hit);
    assert_eq!(two.result.rows[0]["label"], Value::from("a  b"));
    assert_eq!(h.backend.calls(), 2);
}

#[test]
fn test_timeout_interrupts_running_statement() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let limits = ExecutionLimits {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let h = harness(Duration::from_secs(3600), limits).await;
        let aliases: Vec<String> = (0..16).map(|i| format!("pricing_data p{}", i)).collect();
        let slow = format!("SELECT count(*) AS c FROM {}", aliases.join(", "));

        let started = std::time::Instant::now();
        let response = h.engine.ask(QueryRequest::new("count").with_candidate(slow.clone(), 0.9)).await;

        assert_eq!(response.source, QuerySource::Primary);
        assert_eq!(response.result.error_kind(), Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));

        // Only one blocking thread exists; it must have been released
        let followup = tokio::time::timeout(Duration::from_secs(5), tokio::task::spawn_blocking(|| 7)).await;
        assert_eq!(followup.unwrap().unwrap(), 7);

        // Timeouts are never cached
        let again = h.engine.ask(QueryRequest::new("count").with_candidate(slow, 0.9)).await;
        assert!(!again.result.cache_hit);
    });
}

#[tokio::test]
async fn test_competitor_question_joins_tables() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let response = h.engine.ask(QueryRequest::new("our prices versus Acme")).await;

    assert!(response.result.success, "{:?}", response.result.error);
    assert_eq!(response.result.row_count, 1);
    assert_eq!(response.result.rows[0]["competitor_name"], Value::from("Acme"));
}

#[tokio::test]
async fn test_schema_introspection_is_forwarded() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;

    let tables = h.engine.list_tables().await.unwrap();
    assert!(tables.contains(&"pricing_data".to_string()));

    let schema = h.engine.describe_schema("pricing_data").await.unwrap();
    assert_eq!(schema.columns.len(), 8);
    assert_eq!(schema.sample_rows.len(), 5);
}

#[tokio::test]
async fn test_cache_survives_restart_and_index_corruption() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db = seed_database(dir.path());
    let cache_dir = dir.path().join("cache");
    let config = EngineConfig {
        backend: BackendConfig::Sqlite { path: db },
        cache: CacheConfig {
            directory: cache_dir.clone(),
            ..Default::default()
        },
        ..Default::default()
    };

    let engine = QueryEngine::from_config(&config).await.unwrap();
    engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;
    engine.shutdown().await;
    drop(engine);

    let engine = QueryEngine::from_config(&config).await.unwrap();
    assert!(engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await.result.cache_hit);
    engine.shutdown().await;
    drop(engine);

    std::fs::write(cache_dir.join("index.json"), b"{ not json").unwrap();
    let engine = QueryEngine::from_config(&config).await.unwrap();
    let response = engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;
    assert!(response.result.success);
    assert!(!response.result.cache_hit);
}

#[tokio::test]
async fn test_cache_store_is_shared_across_tasks() {
    let h = harness(Duration::from_secs(3600), ExecutionLimits::default()).await;
    let engine = Arc::new(h.engine);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let question = if i % 2 == 0 { CURRENT_PRICE_QUESTION } else { "cheapest 3 products" };
            engine.ask(QueryRequest::new(question)).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().result.success);
    }

    assert_eq!(engine.metrics().total_queries, 8);
    assert_eq!(engine.cache_stats().await.unwrap().total_entries, 2);
}

async fn mock_warehouse(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/projects/acme-prod/datasets/pricing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "acme-prod:pricing"})))
        .mount(server)
        .await;
}

fn warehouse_config(server: &MockServer, dir: &Path) -> EngineConfig {
    let token = dir.join("token");
    std::fs::write(&token, "test-token\n").unwrap();

    EngineConfig {
        backend: BackendConfig::Warehouse(WarehouseSettings {
            endpoint: server.uri(),
            project: "acme-prod".to_string(),
            dataset: "pricing".to_string(),
            credentials_path: Some(token),
            ..Default::default()
        }),
        cache: CacheConfig {
            enabled: false,
            ..Default::default()
        },
        limits: LimitsConfig {
            max_bytes_billed: Some(5_000_000),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_warehouse_current_price_scenario() {
    init_tracing();
    let server = MockServer::start().await;
    mock_warehouse(&server).await;
    Mock::given(method("POST"))
        .and(path("/projects/acme-prod/queries"))
        .and(body_partial_json(json!({"maximumBytesBilled": "5000000", "maxResults": 1001})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "product_id", "type": "STRING"},
                {"name": "current_price", "type": "FLOAT"}
            ]},
            "rows": [{"f": [{"v": "123456"}, {"v": "19.99"}]}],
            "totalBytesProcessed": "4096",
            "totalBytesBilled": "10485760"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = QueryEngine::from_config(&warehouse_config(&server, dir.path())).await.unwrap();
    let response = engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;

    assert!(response.query_text.contains("`acme-prod.pricing.pricing_data`"));
    assert!(response.result.success, "{:?}", response.result.error);
    assert_eq!(response.result.rows[0]["current_price"], Value::Float(19.99));
    assert_eq!(response.result.bytes_processed, Some(4096));
    assert_eq!(response.result.bytes_billed, Some(10485760));
    assert_eq!(engine.metrics().total_bytes_processed, 4096);
}

#[tokio::test]
async fn test_warehouse_access_denied_is_mapped() {
    let server = MockServer::start().await;
    mock_warehouse(&server).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "Access Denied: Table pricing_data", "errors": [{"reason": "accessDenied"}]}
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let engine = QueryEngine::from_config(&warehouse_config(&server, dir.path())).await.unwrap();
    let response = engine.ask(QueryRequest::new(CURRENT_PRICE_QUESTION)).await;

    assert_eq!(response.result.error_kind(), Some(ErrorKind::AccessDenied));
    assert!(response.result.error.unwrap().message.contains("Access Denied"));
}

#[tokio::test]
async fn test_unreachable_warehouse_fails_startup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let result = QueryEngine::from_config(&warehouse_config(&server, dir.path())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cache_trait_object_is_usable_directly() {
    let dir = TempDir::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let cache: Arc<dyn ResultCache> = Arc::new(
        DiskCache::open_with_clock(dir.path(), Duration::from_secs(10), 10, clock)
            .await
            .unwrap(),
    );
    assert_eq!(cache.stats().await.unwrap().total_entries, 0);
}
