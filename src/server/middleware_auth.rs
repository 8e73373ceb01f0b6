//! API-key middleware for worker- and admin-facing routes.
//!
//! When the orchestrator is configured with an API key, every protected
//! request must carry it in the `x-api-key` header. Probes and `/metrics`
//! bypass this (kubelet and Prometheus don't hold keys). Transport
//! security (TLS / mTLS) terminates at the fronting proxy.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(
    expected: Option<String>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected else {
        return next.run(req).await;
    };
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    match presented {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"code": "unauthenticated", "reason": "missing or invalid x-api-key"})),
        )
            .into_response(),
    }
}

/// Compare keys without leaking length-of-match timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
