//! Device API — register, unregister, list, admin commands.

use super::AppState;
use crate::command::{Command, CommandEnvelope};
use crate::db::{DeviceCapabilities, DeviceFilter};
use crate::error::ApiError;
use crate::telemetry::DeviceMetrics;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub(super) struct RegisterPayload {
    name: String,
    device_model: String,
    os_version: String,
    capabilities: DeviceCapabilities,
    #[serde(default)]
    initial_metrics: DeviceMetrics,
}

pub(super) async fn handler_register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device_id = state
        .orchestra
        .db
        .register_device(
            &payload.name,
            &payload.device_model,
            &payload.os_version,
            &payload.capabilities,
            &payload.initial_metrics.clamped(),
        )
        .await
        .map_err(ApiError::storage)?;
    tracing::info!(
        device_id = %device_id,
        name = %payload.name,
        model = %payload.device_model,
        "device registered"
    );
    Ok(Json(serde_json::json!({ "device_id": device_id })))
}

pub(super) async fn handler_unregister(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let known = state
        .orchestra
        .db
        .unregister_device(device_id)
        .await
        .map_err(ApiError::storage)?;
    if !known {
        return Err(ApiError::NotFound(format!("device {}", device_id)));
    }
    state.orchestra.forget_device(device_id).await;
    tracing::info!(device_id = %device_id, "device unregistered");
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn handler_get(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<crate::db::DeviceRow>, ApiError> {
    let row = state
        .orchestra
        .db
        .get_device(device_id)
        .await
        .map_err(ApiError::storage)?
        .ok_or_else(|| ApiError::NotFound(format!("device {}", device_id)))?;
    Ok(Json(row))
}

pub(super) async fn handler_list(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DeviceFilter>,
) -> Result<Json<Vec<crate::db::DeviceRow>>, ApiError> {
    let rows = state
        .orchestra
        .db
        .list_devices(&filter)
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(rows))
}

/// Queue an operator command (`update_interval`, `shutdown`) for delivery
/// on the device's next heartbeat. Training commands belong to the
/// coordinator and are refused here.
pub(super) async fn handler_command(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<Uuid>,
    Json(envelope): Json<CommandEnvelope>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state
        .orchestra
        .db
        .get_device(device_id)
        .await
        .map_err(ApiError::storage)?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("device {}", device_id)));
    }
    let command = Command::from_envelope(&envelope)
        .ok_or_else(|| ApiError::Precondition(format!("unparseable command '{}'", envelope.kind)))?;
    match command {
        Command::UpdateInterval { .. } | Command::Shutdown => {}
        other => {
            return Err(ApiError::Precondition(format!(
                "command '{}' is coordinator-managed",
                other.kind()
            )))
        }
    }
    state.orchestra.enqueue_command(device_id, command).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
