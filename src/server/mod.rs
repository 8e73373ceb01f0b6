//! # Server — HTTP/WebSocket API and Background Tasks
//!
//! Runs the Axum server that fronts the orchestrator core: device
//! registration, the duplex heartbeat WebSocket, model download/upload,
//! gradient submission, and the job admin API. Also owns the long-lived
//! background tasks: the stale-device sweeper, the Prometheus gauge
//! refresh, blob GC, and resuming job runners after a restart.

mod middleware_auth;
mod routes_devices;
mod routes_health;
mod routes_jobs;
mod routes_models;
mod ws;

use crate::config::OrchestratorConfig;
use crate::coordinator::JobRunner;
use crate::db::Database;
use crate::kv::RedisKv;
use crate::model_store::ModelStore;
use crate::prom_metrics::Metrics;
use crate::Orchestra;
use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Model uploads dominate request size; gradients for edge models fit
/// comfortably below this too.
const BODY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Ceiling on concurrently running jobs.
pub const MAX_RUNNING_JOBS: i64 = 8;

pub struct AppState {
    pub orchestra: Arc<Orchestra>,
    pub prom: Metrics,
}

impl AppState {
    pub fn new(orchestra: Arc<Orchestra>) -> Arc<Self> {
        Arc::new(AppState {
            orchestra,
            prom: Metrics::new(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api_key = state.orchestra.config.api_key.clone();
    let protected = Router::new()
        .route("/ws/heartbeat", get(ws::handler_heartbeat))
        .route(
            "/api/devices/register",
            post(routes_devices::handler_register),
        )
        .route("/api/devices", get(routes_devices::handler_list))
        .route("/api/devices/{id}", get(routes_devices::handler_get))
        .route(
            "/api/devices/{id}/unregister",
            post(routes_devices::handler_unregister),
        )
        .route(
            "/api/devices/{id}/command",
            post(routes_devices::handler_command),
        )
        .route(
            "/api/jobs",
            get(routes_jobs::handler_list).post(routes_jobs::handler_create),
        )
        .route("/api/jobs/{id}", get(routes_jobs::handler_get))
        .route("/api/jobs/{id}/cancel", post(routes_jobs::handler_cancel))
        .route(
            "/api/jobs/{id}/rounds/{round}/submit",
            post(routes_models::handler_submit_gradients),
        )
        .route(
            "/api/models/upload",
            post(routes_models::handler_upload),
        )
        .route("/api/models/{id}", get(routes_models::handler_stat))
        .route(
            "/api/models/{id}/download",
            get(routes_models::handler_download),
        )
        .route("/api/events", get(routes_health::handler_events))
        .layer(axum::middleware::from_fn(
            move |req, next| middleware_auth::require_api_key(api_key.clone(), req, next),
        ));

    // Probes and metrics stay unauthenticated for the scraper and kubelet.
    Router::new()
        .merge(protected)
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Start the orchestrator: connect storage, resume running jobs, spawn
/// background tasks, and serve until SIGINT/SIGTERM.
pub async fn run(
    port: u16,
    database_url: &str,
    redis_url: Option<&str>,
    config: OrchestratorConfig,
) -> Result<()> {
    let db = Database::connect(database_url).await?;
    let kv = match redis_url {
        Some(url) => match RedisKv::connect(url).await {
            Ok(kv) => Some(kv),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, running single-replica");
                None
            }
        },
        None => None,
    };
    let store = Arc::new(ModelStore::new(
        config.blob_dir.clone(),
        config.chunk_size_bytes,
        config.blob_retention(),
    )?);
    let orchestra = Arc::new(Orchestra::new(db, kv, store, config));
    let state = AppState::new(orchestra.clone());

    // Resume jobs that were running when the previous process stopped.
    for job in orchestra.db.running_jobs().await? {
        tracing::info!(job_id = %job.job_id, round = job.current_round, "resuming job");
        orchestra
            .store
            .pin(&job.current_model_id, &job.job_id.to_string());
        JobRunner::spawn(orchestra.clone(), job.job_id);
    }

    tokio::spawn(crate::sweeper::run(orchestra.clone()));

    // Background task: Prometheus gauges + hourly blob GC.
    let gauge_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new();
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        let mut last_gc = std::time::Instant::now();
        loop {
            interval.tick().await;
            sys.refresh_cpu_all();
            sys.refresh_memory();
            gauge_state
                .prom
                .cpu_usage_percent
                .set(sys.global_cpu_usage() as f64);
            let mem_pct = if sys.total_memory() > 0 {
                sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
            } else {
                0.0
            };
            gauge_state.prom.memory_usage_percent.set(mem_pct);

            match gauge_state.orchestra.db.count_devices_by_status().await {
                Ok(counts) => {
                    let of = |status: &str| {
                        counts
                            .iter()
                            .find(|(s, _)| s == status)
                            .map(|(_, n)| *n)
                            .unwrap_or(0)
                    };
                    gauge_state
                        .prom
                        .devices_connected
                        .set(of("online") + of("training"));
                    gauge_state.prom.devices_training.set(of("training"));
                }
                Err(e) => tracing::warn!(error = %e, "device count refresh failed"),
            }
            match gauge_state.orchestra.db.count_running_jobs().await {
                Ok(n) => {
                    gauge_state.prom.jobs_active.set(n);
                }
                Err(e) => tracing::warn!(error = %e, "job count refresh failed"),
            }

            if last_gc.elapsed() >= Duration::from_secs(3600) {
                last_gc = std::time::Instant::now();
                let store = gauge_state.orchestra.store.clone();
                let removed = tokio::task::spawn_blocking(move || {
                    store.gc(std::time::SystemTime::now())
                })
                .await;
                match removed {
                    Ok(Ok(ids)) if !ids.is_empty() => {
                        tracing::info!(count = ids.len(), "blob GC removed artifacts")
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "blob GC failed"),
                    _ => {}
                }
            }
        }
    });

    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("orchestrator shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received SIGINT, shutting down");
    }
}
