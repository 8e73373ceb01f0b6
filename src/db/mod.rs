//! # Database — PostgreSQL Storage Layer
//!
//! Async database operations for the device registry and training-job state
//! via `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `devices`: fleet registry — capabilities, status, last metrics/seen
//! - `jobs`: training job configuration and lifecycle
//! - `rounds`: per-round participants, deadline, aggregate results
//! - `submissions`: worker weight-delta uploads, one per (job, round, device)
//!
//! ## Module Structure
//!
//! - [`devices`] — register, touch, list, offline sweeps
//! - [`jobs`] — job lifecycle, round rows, submission inserts
//!
//! Registry writes are row-scoped updates keyed by `device_id`; round rows
//! are mutated only by the owning job's coordinator task. Model blobs live
//! in the filesystem store, not here.

pub mod devices;
pub mod jobs;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

// ── Device types ────────────────────────────────────────────────

/// Static hardware/software capabilities reported at registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub chip: String,
    pub ram_bytes: u64,
    pub cpu_cores: u32,
    pub gpu_cores: u32,
    pub neural_cores: u32,
    /// Training frameworks the worker can execute (e.g. "coreml", "tflite").
    pub supported_frameworks: Vec<String>,
}

impl DeviceCapabilities {
    pub fn supports(&self, framework: &str) -> bool {
        self.supported_frameworks.iter().any(|f| f == framework)
    }
}

/// Device lifecycle status. Stored as TEXT; rows carry the string form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Training,
    Error,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Training => "training",
            DeviceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            "training" => Some(DeviceStatus::Training),
            "error" => Some(DeviceStatus::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_id: Uuid,
    pub name: String,
    pub device_model: String,
    pub os_version: String,
    pub capabilities: Json<DeviceCapabilities>,
    pub status: String,
    pub last_metrics: Option<Json<crate::telemetry::DeviceMetrics>>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
}

/// Filter for device listings. All fields are conjunctive.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeviceFilter {
    pub status: Option<String>,
    /// Only devices whose capabilities include this framework.
    pub framework: Option<String>,
}

// ── Job / round / submission types ──────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    Aggregating,
    Closed,
    Aborted,
}

impl RoundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Open => "open",
            RoundStatus::Aggregating => "aggregating",
            RoundStatus::Closed => "closed",
            RoundStatus::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct JobRow {
    pub job_id: Uuid,
    pub architecture: String,
    pub initial_model_id: String,
    /// Global model at the head of the job (advances each closed round).
    pub current_model_id: String,
    pub status: String,
    pub error: Option<String>,
    pub current_round: i32,
    pub target_rounds: i32,
    pub quorum: i32,
    pub round_timeout_s: i64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub stopped_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct RoundRow {
    pub job_id: Uuid,
    pub round: i32,
    /// Retry attempt for this round number, starting at 1.
    pub attempt: i32,
    pub global_model_id: String,
    pub status: String,
    pub participants: Json<Vec<Uuid>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub deadline: chrono::DateTime<chrono::Utc>,
    pub aggregate_model_id: Option<String>,
    pub avg_loss: Option<f64>,
    pub avg_accuracy: Option<f64>,
    pub delta_norm: Option<f64>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct SubmissionRow {
    pub job_id: Uuid,
    pub round: i32,
    pub device_id: Uuid,
    pub blob: Vec<u8>,
    pub num_samples: i64,
    pub metrics: Json<std::collections::HashMap<String, f64>>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Database { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    /// Backs the `/readyz` readiness probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────
