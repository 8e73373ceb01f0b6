//! Job API — submit, inspect, cancel training jobs.

use super::{AppState, MAX_RUNNING_JOBS};
use crate::coordinator::JobRunner;
use crate::db::{JobStatus, RoundStatus};
use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub(super) struct CreateJobPayload {
    architecture: String,
    /// Content id of the initial global model; must already be uploaded.
    initial_model_id: String,
    target_rounds: u32,
    quorum: Option<u32>,
    round_timeout_s: Option<u64>,
}

pub(super) async fn handler_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if payload.target_rounds == 0 {
        return Err(ApiError::Precondition("target_rounds must be at least 1".into()));
    }
    let running = state
        .orchestra
        .db
        .count_running_jobs()
        .await
        .map_err(ApiError::storage)?;
    if running >= MAX_RUNNING_JOBS {
        return Err(ApiError::ResourceExhausted(format!(
            "{} jobs already running",
            running
        )));
    }
    let model_known = state
        .orchestra
        .store
        .stat(&payload.initial_model_id)
        .map_err(ApiError::storage)?
        .is_some();
    if !model_known {
        return Err(ApiError::NotFound(format!(
            "model {}",
            payload.initial_model_id
        )));
    }

    let quorum = payload
        .quorum
        .unwrap_or(state.orchestra.config.quorum_min as u32)
        .max(1);
    let round_timeout_s = payload
        .round_timeout_s
        .unwrap_or(state.orchestra.config.round_timeout_s);
    let job_id = state
        .orchestra
        .db
        .create_job(
            &payload.architecture,
            &payload.initial_model_id,
            payload.target_rounds,
            quorum,
            round_timeout_s,
        )
        .await
        .map_err(ApiError::storage)?;
    state
        .orchestra
        .store
        .pin(&payload.initial_model_id, &job_id.to_string());
    JobRunner::spawn(state.orchestra.clone(), job_id);
    tracing::info!(
        job_id = %job_id,
        architecture = %payload.architecture,
        target_rounds = payload.target_rounds,
        quorum,
        "job submitted"
    );
    Ok(Json(serde_json::json!({ "job_id": job_id })))
}

pub(super) async fn handler_list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::db::JobRow>>, ApiError> {
    let rows = state
        .orchestra
        .db
        .list_jobs()
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(rows))
}

pub(super) async fn handler_get(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .orchestra
        .db
        .get_job(job_id)
        .await
        .map_err(ApiError::storage)?
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    let rounds = state
        .orchestra
        .db
        .list_rounds(job_id)
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(serde_json::json!({ "job": job, "rounds": rounds })))
}

/// Cancel a running job. The runner observes the status flip at its next
/// suspension point, stops the current participants, and exits.
pub(super) async fn handler_cancel(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .orchestra
        .db
        .get_job(job_id)
        .await
        .map_err(ApiError::storage)?
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    if job.status != JobStatus::Running.as_str() {
        return Err(ApiError::Precondition(format!(
            "job is {}, not running",
            job.status
        )));
    }
    state
        .orchestra
        .db
        .update_job_status(job_id, JobStatus::Cancelled, None)
        .await
        .map_err(ApiError::storage)?;
    // If a round is open, flag it aborted so late submissions are refused
    // even before the runner wakes.
    let open_round = job.current_round as u32 + 1;
    if let Ok(Some(round)) = state.orchestra.db.get_round(job_id, open_round).await {
        if round.status == RoundStatus::Open.as_str() {
            state
                .orchestra
                .db
                .set_round_status(job_id, open_round, RoundStatus::Aborted)
                .await
                .ok();
        }
    }
    tracing::info!(job_id = %job_id, "job cancelled");
    Ok(Json(serde_json::json!({ "ok": true })))
}
