//! API integration tests for the orchestrator's Axum routes.
//!
//! Sends synthetic requests straight to the router via
//! `tower::ServiceExt::oneshot` — no TCP listener, no port conflicts.
//!
//! # Prerequisites
//!
//! - A running PostgreSQL instance with `TEST_DATABASE_URL` set.
//!
//! # How to run
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test api_integration -- --test-threads=1
//! ```

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::Engine;
use edgeorchestra::model_store::reassemble;
use edgeorchestra::weights::{Layer, LayerTable};
use http_body_util::BodyExt;
use tower::ServiceExt;

macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::json!(null));
    (status, json)
}

async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!(null));
    (status, json)
}

async fn post_bytes(app: Router, uri: &str, body: Vec<u8>) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/octet-stream")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!(null));
    (status, json)
}

fn sample_model() -> LayerTable {
    LayerTable::new(vec![Layer {
        name: "w".into(),
        values: vec![1.0, 2.0, 3.0, 4.0],
    }])
}

fn register_payload(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "device_model": "iPhone16,1",
        "os_version": "17.4",
        "capabilities": common::test_capabilities(),
        "initial_metrics": common::healthy_metrics(),
    })
}

// == Health ====================================================================

#[tokio::test]
async fn healthz_is_ok() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let (status, _) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn readyz_is_ok_with_database() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn metrics_exposition_renders() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("edgeorchestra_devices_connected"));
}

// == Device API ================================================================

#[tokio::test]
async fn register_returns_device_id() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let (status, body) = post_json(app, "/api/devices/register", &register_payload("a")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(uuid::Uuid::parse_str(body["device_id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn duplicate_register_names_both_listed() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let (_, a) = post_json(app.clone(), "/api/devices/register", &register_payload("twin")).await;
    let (_, b) = post_json(app.clone(), "/api/devices/register", &register_payload("twin")).await;
    assert_ne!(a["device_id"], b["device_id"]);
    let (status, list) = get(app, "/api/devices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn get_unknown_device_is_not_found() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let (status, body) = get(
        app,
        &format!("/api/devices/{}", uuid::Uuid::new_v4()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn unregister_flips_status() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let (_, body) = post_json(app.clone(), "/api/devices/register", &register_payload("d")).await;
    let id = body["device_id"].as_str().unwrap().to_string();
    let (status, _) = post_json(
        app.clone(),
        &format!("/api/devices/{}/unregister", id),
        &serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, device) = get(app, &format!("/api/devices/{}", id)).await;
    assert_eq!(device["status"], "offline");
}

#[tokio::test]
async fn operator_command_queues_shutdown_but_refuses_training() {
    require_db!();
    let (_dir, orch, app) = common::build_test_app().await;
    let (_, body) = post_json(app.clone(), "/api/devices/register", &register_payload("d")).await;
    let id: uuid::Uuid = body["device_id"].as_str().unwrap().parse().unwrap();

    let (status, _) = post_json(
        app.clone(),
        &format!("/api/devices/{}/command", id),
        &serde_json::json!({"type": "shutdown"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        orch.pop_command(id).await,
        Some(edgeorchestra::command::Command::Shutdown)
    );

    let (status, body) = post_json(
        app,
        &format!("/api/devices/{}/command", id),
        &serde_json::json!({"type": "stop_training", "parameters": {"job_id": "x"}}),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "precondition");
}

// == Model API =================================================================

#[tokio::test]
async fn upload_returns_content_id_and_stat_works() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let bytes = sample_model().encode_f32();
    let expected = edgeorchestra::model_store::content_id(&bytes);

    let (status, body) = post_bytes(app.clone(), "/api/models/upload", bytes.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_id"], expected.as_str());
    assert_eq!(body["size"], bytes.len());

    let (status, stat) = get(app, &format!("/api/models/{}", expected)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stat["size"], bytes.len());
}

#[tokio::test]
async fn download_streams_verifiable_chunks() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    // Big enough for several 64-byte test chunks
    let bytes = LayerTable::new(vec![Layer {
        name: "w".into(),
        values: (0..200).map(|i| i as f32).collect(),
    }])
    .encode_f32();
    let (_, body) = post_bytes(app.clone(), "/api/models/upload", bytes.clone()).await;
    let id = body["model_id"].as_str().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/models/{}/download", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let raw = response.into_body().collect().await.unwrap().to_bytes();

    // Parse length-prefixed frames and verify the reassembly contract
    let mut frames = Vec::new();
    let mut rest = &raw[..];
    while !rest.is_empty() {
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        frames.push(bincode::deserialize(&rest[4..4 + len]).unwrap());
        rest = &rest[4 + len..];
    }
    assert!(frames.len() > 2);
    assert_eq!(reassemble(&frames).unwrap(), bytes);
}

#[tokio::test]
async fn download_unknown_model_is_not_found() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let missing = edgeorchestra::model_store::content_id(b"missing");
    let (status, body) = get(app, &format!("/api/models/{}/download", missing)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

// == Job API ===================================================================

#[tokio::test]
async fn create_job_requires_known_model() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let missing = edgeorchestra::model_store::content_id(b"none");
    let (status, body) = post_json(
        app,
        "/api/jobs",
        &serde_json::json!({
            "architecture": "mnist-cnn",
            "initial_model_id": missing,
            "target_rounds": 2,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn create_then_cancel_job() {
    require_db!();
    let (_dir, _orch, app) = common::build_test_app().await;
    let bytes = sample_model().encode_f32();
    let (_, upload) = post_bytes(app.clone(), "/api/models/upload", bytes).await;
    let model_id = upload["model_id"].as_str().unwrap();

    let (status, body) = post_json(
        app.clone(),
        "/api/jobs",
        &serde_json::json!({
            "architecture": "mnist-cnn",
            "initial_model_id": model_id,
            "target_rounds": 3,
            "quorum": 2,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, detail) = get(app.clone(), &format!("/api/jobs/{}", job_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["job"]["status"], "running");
    assert_eq!(detail["job"]["quorum"], 2);

    let (status, _) = post_json(
        app.clone(),
        &format!("/api/jobs/{}/cancel", job_id),
        &serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Cancelling a non-running job is a precondition failure
    let (status, body) = post_json(
        app,
        &format!("/api/jobs/{}/cancel", job_id),
        &serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "precondition");
}

#[tokio::test]
async fn submit_gradients_validates_round_and_duplicates() {
    require_db!();
    let (_dir, orch, app) = common::build_test_app().await;

    // Device + model + job
    let (_, reg) = post_json(app.clone(), "/api/devices/register", &register_payload("w1")).await;
    let device_id: uuid::Uuid = reg["device_id"].as_str().unwrap().parse().unwrap();
    let model = sample_model();
    let model_bytes = model.encode_f32();
    let (_, upload) = post_bytes(app.clone(), "/api/models/upload", model_bytes).await;
    let model_id = upload["model_id"].as_str().unwrap().to_string();
    let job_id = orch
        .db
        .create_job("mnist-cnn", &model_id, 1, 1, 300)
        .await
        .unwrap();

    // Open round 1 directly (no runner in this test)
    let deadline = chrono::Utc::now() + chrono::Duration::seconds(300);
    orch.db
        .open_round(job_id, 1, 1, &model_id, &[device_id], deadline)
        .await
        .unwrap();

    let delta_b64 = base64::engine::general_purpose::STANDARD.encode(model.encode_f16_lz4());
    let submit_uri = format!("/api/jobs/{}/rounds/1/submit", job_id);
    let payload = serde_json::json!({
        "device_id": device_id,
        "model_id": model_id,
        "gradients": delta_b64,
        "num_samples": 10,
        "metrics": {"loss": 0.4},
    });

    // Wrong round number
    let (status, body) = post_json(
        app.clone(),
        &format!("/api/jobs/{}/rounds/7/submit", job_id),
        &payload,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    // Accepted
    let (status, body) = post_json(app.clone(), &submit_uri, &payload).await;
    assert_eq!(status, StatusCode::OK, "{:?}", body);
    assert_eq!(body["accepted"], true);

    // Duplicate
    let (status, body) = post_json(app.clone(), &submit_uri, &payload).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_submitted");

    // Garbage blob from a non-participant device
    let mut bad = payload.clone();
    bad["device_id"] = serde_json::json!(uuid::Uuid::new_v4());
    let (status, body) = post_json(app.clone(), &submit_uri, &bad).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "precondition");

    // Malformed blob (bad magic) from the participant — round already has
    // its submission, so reset the round first
    orch.db
        .open_round(job_id, 1, 2, &model_id, &[device_id], deadline)
        .await
        .unwrap();
    let mut corrupt = payload.clone();
    corrupt["gradients"] =
        serde_json::json!(base64::engine::general_purpose::STANDARD.encode([0x7fu8, 1, 2, 3]));
    let (status, body) = post_json(app, &submit_uri, &corrupt).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "precondition");
}

#[tokio::test]
async fn late_submission_after_close_is_refused() {
    require_db!();
    let (_dir, orch, app) = common::build_test_app().await;
    let (_, reg) = post_json(app.clone(), "/api/devices/register", &register_payload("w1")).await;
    let device_id: uuid::Uuid = reg["device_id"].as_str().unwrap().parse().unwrap();
    let model = sample_model();
    let (_, upload) = post_bytes(app.clone(), "/api/models/upload", model.encode_f32()).await;
    let model_id = upload["model_id"].as_str().unwrap().to_string();
    let job_id = orch.db.create_job("mnist-cnn", &model_id, 1, 1, 300).await.unwrap();
    let deadline = chrono::Utc::now() + chrono::Duration::seconds(300);
    orch.db
        .open_round(job_id, 1, 1, &model_id, &[device_id], deadline)
        .await
        .unwrap();
    orch.db
        .set_round_status(job_id, 1, edgeorchestra::db::RoundStatus::Aggregating)
        .await
        .unwrap();

    let payload = serde_json::json!({
        "device_id": device_id,
        "model_id": model_id,
        "gradients": base64::engine::general_purpose::STANDARD.encode(model.encode_f16_lz4()),
        "num_samples": 10,
    });
    let (status, body) =
        post_json(app, &format!("/api/jobs/{}/rounds/1/submit", job_id), &payload).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "precondition");
}

// == Auth middleware ===========================================================

#[tokio::test]
async fn api_key_required_when_configured() {
    require_db!();
    let db = common::setup_test_db().await;
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = common::test_config(dir.path());
    config.api_key = Some("sekrit".into());
    let store = std::sync::Arc::new(
        edgeorchestra::model_store::ModelStore::new(
            dir.path(),
            config.chunk_size_bytes,
            std::time::Duration::from_secs(3600),
        )
        .unwrap(),
    );
    let orchestra = std::sync::Arc::new(edgeorchestra::Orchestra::new(db, None, store, config));
    let app = edgeorchestra::server::build_router(edgeorchestra::server::AppState::new(orchestra));

    // No key → 401
    let (status, _) = get(app.clone(), "/api/devices").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Probes bypass auth
    let (status, _) = get(app.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    // Correct key → 200
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/devices")
                .header("x-api-key", "sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
