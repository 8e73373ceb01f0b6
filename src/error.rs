//! # Error — API Error Taxonomy
//!
//! Every error surfaced at the RPC boundary maps to one of a fixed set of
//! codes, so workers and admin tooling can branch on `code` without parsing
//! reason strings. Workers treat `precondition` and `not_found` as terminal
//! for the current round, and `unavailable` as retriable with backoff.
//!
//! | Code | HTTP | Meaning |
//! |------|------|---------|
//! | `not_found` | 404 | unknown device / model / job |
//! | `already_exists` | 409 | duplicate registration guard |
//! | `already_submitted` | 409 | duplicate submission for a round |
//! | `precondition` | 412 | bad blob, layer mismatch, stale sequence |
//! | `unavailable` | 503 | storage transient failure |
//! | `resource_exhausted` | 429 | command queue full, too many jobs |
//! | `deadline_exceeded` | 504 | round deadline (admin-facing only) |
//! | `internal` | 500 | invariant violation; round aborted |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("already submitted for round {round}")]
    AlreadySubmitted { round: u32 },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code for the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::AlreadySubmitted { .. } => "already_submitted",
            ApiError::Precondition(_) => "precondition",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::ResourceExhausted(_) => "resource_exhausted",
            ApiError::DeadlineExceeded(_) => "deadline_exceeded",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) | ApiError::AlreadySubmitted { .. } => StatusCode::CONFLICT,
            ApiError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wrap a storage error as `unavailable` (callers may retry).
    pub fn storage(err: impl std::fmt::Display) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("row".to_string()),
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.code(),
            "reason": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
