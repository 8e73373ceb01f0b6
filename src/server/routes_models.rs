//! Model API — chunked download, admin upload, gradient submission.

use super::AppState;
use crate::db::RoundStatus;
use crate::error::ApiError;
use crate::weights::LayerTable;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Admin upload: raw model bytes in, content id out. Idempotent.
pub(super) async fn handler_upload(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::Precondition("empty model body".into()));
    }
    let store = state.orchestra.store.clone();
    let size = body.len();
    let model_id = tokio::task::spawn_blocking(move || store.put(&body))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::storage)?;
    tracing::info!(model_id = %model_id, size, "model uploaded");
    Ok(Json(serde_json::json!({ "model_id": model_id, "size": size })))
}

pub(super) async fn handler_stat(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stat = state
        .orchestra
        .store
        .stat(&model_id)
        .map_err(ApiError::storage)?
        .ok_or_else(|| ApiError::NotFound(format!("model {}", model_id)))?;
    let pins = state.orchestra.store.pin_count(&model_id);
    Ok(Json(serde_json::json!({
        "model_id": stat.model_id,
        "size": stat.size,
        "pins": pins,
    })))
}

#[derive(Deserialize)]
pub(super) struct DownloadParams {
    device_id: Option<Uuid>,
}

/// Stream a model as framed chunks: one metadata frame, then data frames
/// with strictly increasing indices (§ wire contract in `model_store`).
pub(super) async fn handler_download(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    if let Some(device_id) = params.device_id {
        let known = state
            .orchestra
            .db
            .get_device(device_id)
            .await
            .map_err(ApiError::storage)?
            .is_some();
        if !known {
            return Err(ApiError::NotFound(format!("device {}", device_id)));
        }
    }
    let store = state.orchestra.store.clone();
    let id = model_id.clone();
    let frames: Vec<Bytes> = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Vec<Bytes>>> {
        let Some(reader) = store.open(&id)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(reader.total_chunks() as usize + 1);
        for frame in reader {
            out.push(Bytes::from(frame?.to_wire()));
        }
        Ok(Some(out))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::storage)?
    .ok_or_else(|| ApiError::NotFound(format!("model {}", model_id)))?;

    let stream = futures::stream::iter(frames.into_iter().map(Ok::<_, std::io::Error>));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

#[derive(Deserialize)]
pub(super) struct SubmitGradientsPayload {
    device_id: Uuid,
    /// Model the delta was trained against.
    model_id: String,
    /// Base64-encoded delta blob (magic `0x01` or `0x00`).
    gradients: String,
    num_samples: u64,
    #[serde(default)]
    metrics: HashMap<String, f64>,
}

/// Accept a worker's weight-delta submission for an open round.
///
/// Workers treat `precondition` / `not_found` as terminal for the round
/// and `unavailable` as retriable; the distinction matters here.
pub(super) async fn handler_submit_gradients(
    State(state): State<Arc<AppState>>,
    Path((job_id, round)): Path<(Uuid, u32)>,
    Json(payload): Json<SubmitGradientsPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let orchestra = &state.orchestra;
    let job = orchestra
        .db
        .get_job(job_id)
        .await
        .map_err(ApiError::storage)?
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
    let round_row = orchestra
        .db
        .get_round(job_id, round)
        .await
        .map_err(ApiError::storage)?
        .ok_or_else(|| ApiError::NotFound(format!("job {} round {}", job_id, round)))?;

    if round_row.status != RoundStatus::Open.as_str() {
        return Err(ApiError::Precondition(format!(
            "round {} is {}, not accepting submissions",
            round, round_row.status
        )));
    }
    if !round_row.participants.0.contains(&payload.device_id) {
        return Err(ApiError::Precondition(format!(
            "device {} is not a participant of round {}",
            payload.device_id, round
        )));
    }
    if payload.model_id != round_row.global_model_id {
        return Err(ApiError::Precondition(format!(
            "delta was trained against model {}, round uses {}",
            payload.model_id, round_row.global_model_id
        )));
    }

    let blob = base64::engine::general_purpose::STANDARD
        .decode(&payload.gradients)
        .map_err(|e| ApiError::Precondition(format!("gradients are not valid base64: {}", e)))?;
    // Structural check up front so the worker learns about a bad blob now,
    // not at aggregation time. Layer-set equality is enforced later against
    // the global model.
    let decode_check = {
        let blob = blob.clone();
        tokio::task::spawn_blocking(move || LayerTable::decode(&blob).map(|_| ()))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    decode_check.map_err(|e| ApiError::Precondition(format!("malformed delta blob: {}", e)))?;

    let inserted = orchestra
        .db
        .insert_submission(
            job_id,
            round,
            payload.device_id,
            &blob,
            payload.num_samples,
            &payload.metrics,
        )
        .await
        .map_err(ApiError::storage)?;
    if !inserted {
        state
            .prom
            .submissions
            .get_or_create(&crate::prom_metrics::OutcomeLabel::of("duplicate"))
            .inc();
        return Err(ApiError::AlreadySubmitted { round });
    }

    state
        .prom
        .submissions
        .get_or_create(&crate::prom_metrics::OutcomeLabel::of("accepted"))
        .inc();
    tracing::info!(
        job_id = %job_id,
        round,
        device_id = %payload.device_id,
        num_samples = payload.num_samples,
        blob_size = blob.len(),
        architecture = %job.architecture,
        "submission accepted"
    );
    Ok(Json(serde_json::json!({ "accepted": true })))
}
