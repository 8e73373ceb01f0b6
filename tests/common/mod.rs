//! Shared test helpers for integration tests.

#![allow(dead_code)]

use edgeorchestra::config::OrchestratorConfig;
use edgeorchestra::model_store::ModelStore;
use edgeorchestra::server::AppState;
use edgeorchestra::Orchestra;
use std::sync::{Arc, Once};
use std::time::Duration;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: Once = Once::new();

/// Ensure the test database schema is set up (runs migrations once per test suite).
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = sqlx::PgPool::connect(&test_db_url()).await.unwrap();
            run_migrations(&pool).await;
        });
    });
}

/// Connect to the test database (also ensures schema is set up).
pub async fn setup_test_db() -> edgeorchestra::db::Database {
    ensure_schema();
    let db = edgeorchestra::db::Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

/// Orchestrator config tuned for fast tests: short intervals, tiny chunks.
pub fn test_config(blob_dir: &std::path::Path) -> OrchestratorConfig {
    OrchestratorConfig {
        heartbeat_interval_s: 1,
        miss_threshold: 3,
        sweep_interval_s: 1,
        round_timeout_s: 8,
        round_grace_s: 4,
        selection_backoff_s: 1,
        selection_max_attempts: 3,
        round_max_retries: 1,
        chunk_size_bytes: 64,
        blob_dir: blob_dir.to_path_buf(),
        ..Default::default()
    }
}

/// Build an `Orchestra` context over the test database and a temp blob dir.
/// Returns the tempdir guard alongside so blobs live as long as the test.
pub async fn setup_orchestra() -> (tempfile::TempDir, Arc<Orchestra>) {
    let db = setup_test_db().await;
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(
        ModelStore::new(dir.path(), config.chunk_size_bytes, Duration::from_secs(3600)).unwrap(),
    );
    let orchestra = Arc::new(Orchestra::new(db, None, store, config));
    (dir, orchestra)
}

/// Build an Axum test app router connected to the test database.
pub async fn build_test_app() -> (tempfile::TempDir, Arc<Orchestra>, axum::Router) {
    let (dir, orchestra) = setup_orchestra().await;
    let state = AppState::new(orchestra.clone());
    let router = edgeorchestra::server::build_router(state);
    (dir, orchestra, router)
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql("TRUNCATE TABLE submissions, rounds, jobs, devices CASCADE")
        .execute(pool)
        .await
        .unwrap();
}

/// Run all migrations against the test database.
async fn run_migrations(pool: &sqlx::PgPool) {
    let migration_files = ["migrations/001_devices.sql", "migrations/002_jobs.sql"];

    for file in &migration_files {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(file);
        let sql = std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Migration file {} unreadable: {}", file, e));
        sqlx::raw_sql(&sql).execute(pool).await.unwrap_or_else(|e| {
            panic!("Migration {} failed: {}", file, e);
        });
    }
}

/// Default capabilities for a test device able to train "mnist-cnn".
pub fn test_capabilities() -> edgeorchestra::db::DeviceCapabilities {
    edgeorchestra::db::DeviceCapabilities {
        chip: "A17".into(),
        ram_bytes: 8 * 1024 * 1024 * 1024,
        cpu_cores: 6,
        gpu_cores: 5,
        neural_cores: 16,
        supported_frameworks: vec!["mnist-cnn".into()],
    }
}

/// Healthy metrics that pass the eligibility predicate.
pub fn healthy_metrics() -> edgeorchestra::telemetry::DeviceMetrics {
    edgeorchestra::telemetry::DeviceMetrics {
        cpu_usage: 0.2,
        memory_usage: 0.4,
        thermal_state: 0.1,
        battery_level: 1.0,
        battery_state: edgeorchestra::telemetry::BatteryState::Charging,
        low_power_mode: false,
    }
}
