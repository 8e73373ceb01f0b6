//! Heartbeat WebSocket — one duplex session per connected worker.
//!
//! Client frames are `HeartbeatRequest` JSON; every request produces
//! exactly one `HeartbeatResponse`, in request order (the session is a
//! single sequential loop, so ordering and one-response-ahead backpressure
//! fall out of the structure). Commands ride down in responses only; at
//! most one command per response.
//!
//! Session rules:
//! - The first request must carry a registered `device_id`; unknown ids
//!   get a `not_found` error frame and the socket closes.
//! - Later requests must keep the same `device_id` — a mid-stream switch
//!   drops the session.
//! - A stale `sequence` (zombie stream replay) gets an error response but
//!   keeps the session; the zombie's writes never touch liveness.
//! - Read errors log and drop the session; the worker reconnects.

use super::AppState;
use crate::command::Command;
use crate::db::DeviceStatus;
use crate::liveness::IngestError;
use crate::telemetry::DeviceMetrics;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    device_id: Uuid,
    sequence: u64,
    #[serde(default)]
    metrics: DeviceMetrics,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    command: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    parameters: BTreeMap<String, String>,
    metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl HeartbeatResponse {
    fn error(code: &str, reason: impl Into<String>) -> Self {
        HeartbeatResponse {
            command: "unspecified".into(),
            parameters: BTreeMap::new(),
            metadata: BTreeMap::new(),
            error: Some(format!("{}: {}", code, reason.into())),
        }
    }
}

pub(super) async fn handler_heartbeat(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| session_loop(socket, state))
}

async fn session_loop(mut socket: WebSocket, state: Arc<AppState>) {
    // The id this stream authenticated as, set by the first valid request.
    let mut bound_device: Option<Uuid> = None;

    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(other) => {
                tracing::debug!(?other, "ignoring non-text heartbeat frame");
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "heartbeat read error, dropping session");
                break;
            }
        };
        let request: HeartbeatRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed heartbeat request, dropping session");
                break;
            }
        };

        match bound_device {
            None => {
                let known = state
                    .orchestra
                    .db
                    .get_device(request.device_id)
                    .await
                    .map(|d| d.is_some())
                    .unwrap_or(false);
                if !known {
                    let frame = HeartbeatResponse::error(
                        "not_found",
                        format!("unknown device {}", request.device_id),
                    );
                    send_response(&mut socket, &frame).await;
                    break;
                }
                bound_device = Some(request.device_id);
                tracing::info!(device_id = %request.device_id, "heartbeat session established");
            }
            Some(bound) if bound != request.device_id => {
                tracing::warn!(
                    bound = %bound,
                    got = %request.device_id,
                    "device id changed mid-stream, dropping session"
                );
                break;
            }
            Some(_) => {}
        }

        let response = handle_request(&state, &request).await;
        if !send_response(&mut socket, &response).await {
            break;
        }
    }

    if let Some(device_id) = bound_device {
        tracing::info!(device_id = %device_id, "heartbeat session closed");
    }
}

async fn send_response(socket: &mut WebSocket, response: &HeartbeatResponse) -> bool {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!(error = %e, "heartbeat response serialization failed");
            return false;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

/// Process one heartbeat: touch the registry, ingest liveness, pop at most
/// one command, stamp server metadata.
async fn handle_request(state: &Arc<AppState>, request: &HeartbeatRequest) -> HeartbeatResponse {
    let orchestra = &state.orchestra;
    state.prom.heartbeats.inc();

    let metrics = request.metrics.clone().clamped();
    if let Err(e) = orchestra
        .db
        .touch_device(request.device_id, &metrics, DeviceStatus::Online)
        .await
    {
        tracing::warn!(device_id = %request.device_id, error = %e, "registry touch failed");
    }

    if let Err(IngestError::StaleSequence { stored, got }) = orchestra
        .record_heartbeat(request.device_id, request.sequence, metrics)
        .await
    {
        return HeartbeatResponse::error(
            "precondition",
            format!("stale sequence {} (stored {})", got, stored),
        );
    }

    let command = orchestra.pop_command(request.device_id).await;
    let envelope = command.unwrap_or(Command::Ack).to_envelope();
    let mut metadata = envelope.metadata;
    stamp_metadata(orchestra, &mut metadata);

    HeartbeatResponse {
        command: envelope.kind,
        parameters: envelope.parameters,
        metadata,
        error: None,
    }
}

/// Server telemetry every response carries: the heartbeat cadence and the
/// stats of the latest aggregate, for on-device display.
fn stamp_metadata(orchestra: &crate::Orchestra, metadata: &mut BTreeMap<String, String>) {
    metadata.insert(
        "heartbeat_interval_s".into(),
        orchestra.config.heartbeat_interval_s.to_string(),
    );
    let snapshot = orchestra.last_aggregate.lock().unwrap().clone();
    if let Some(agg) = snapshot {
        metadata.insert("server_job_id".into(), agg.job_id.to_string());
        metadata.insert("server_round".into(), agg.round.to_string());
        if let Some(loss) = agg.avg_loss {
            metadata.insert("server_loss".into(), format!("{:.6}", loss));
        }
        if let Some(acc) = agg.avg_accuracy {
            metadata.insert("server_accuracy".into(), format!("{:.6}", acc));
        }
    }
}
