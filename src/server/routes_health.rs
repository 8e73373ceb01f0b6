//! # Health & Observability Endpoints
//!
//! Kubernetes-compatible health, readiness, and Prometheus metrics
//! endpoints, plus the recent-events feed for operators.
//!
//! | Endpoint | Purpose | K8s Probe |
//! |----------|---------|-----------|
//! | `GET /healthz` | Liveness — process is alive | `livenessProbe` |
//! | `GET /readyz` | Readiness — Postgres reachable | `readinessProbe` |
//! | `GET /metrics` | Prometheus scraping endpoint | `ServiceMonitor` |
//!
//! The readiness probe runs `SELECT 1` with a 2-second timeout. Redis is
//! checked but non-critical: the orchestrator degrades to single-replica
//! command delivery without it.

use super::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

/// Liveness probe: returns 200 if the process is running.
pub async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 200 when the orchestrator can serve requests.
pub async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timeout = std::time::Duration::from_secs(2);

    let db_check = tokio::time::timeout(timeout, state.orchestra.db.health_check()).await;
    match db_check {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => return (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }

    if let Some(kv) = &state.orchestra.kv {
        match tokio::time::timeout(timeout, kv.ping()).await {
            Ok(Ok(())) => {}
            _ => {
                // Redis is optional — warn but don't fail readiness
                tracing::warn!("readyz: redis health check failed (degraded mode)");
            }
        }
    }

    (StatusCode::OK, "ok")
}

/// Prometheus metrics endpoint in text exposition format.
pub async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.prom.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}

#[derive(Deserialize)]
pub(super) struct EventsParams {
    #[serde(default)]
    after: u64,
    limit: Option<usize>,
}

/// Recent orchestrator events, oldest first, cursorable via `after`.
pub(super) async fn handler_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(200);
    Json(state.orchestra.events.recent_since(params.after, limit))
}
