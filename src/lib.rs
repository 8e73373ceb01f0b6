//! # EdgeOrchestra — Federated-Learning Control Plane
//!
//! Server-side core for recruiting mobile/edge devices as training workers:
//! tracks the live fleet over a duplex heartbeat channel, partitions
//! training jobs into rounds, distributes model artifacts, and aggregates
//! worker-submitted weight deltas into new global models.
//!
//! ## Module Organization
//!
//! **Fleet modules** (who is alive, what can they do):
//! - [`db`] — PostgreSQL registry of devices, jobs, rounds, submissions
//! - [`liveness`] — in-memory heartbeat index and per-device command queues
//! - [`kv`] — Redis mirror for cross-replica liveness and command delivery
//! - [`sweeper`] — periodic downgrade of devices past the miss threshold
//! - [`telemetry`] — battery/thermal/utilization snapshot types
//!
//! **Training modules** (what the fleet is doing):
//! - [`coordinator`] — the per-job round state machine
//! - [`aggregator`] — sample-weighted federated averaging
//! - [`weights`] — layer tables, f16+LZ4 delta blob codec
//! - [`model_store`] — content-addressed model artifacts, chunked download
//! - [`command`] — typed command envelopes delivered via heartbeat
//!
//! **Surface modules**:
//! - [`server`] — Axum HTTP/WebSocket API and background tasks
//! - [`events`], [`prom_metrics`], [`config`], [`error`]
//!
//! ## Data Flow
//!
//! ```text
//! Worker ⇄ WS /ws/heartbeat → registry.touch + liveness.ingest → command down
//! Coordinator → select participants → start_training via command queue
//! Worker → POST submit → submissions table → aggregator → new global model
//! Sweeper → devices past threshold → offline + device_offline event
//! ```

pub mod aggregator;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod kv;
pub mod liveness;
pub mod model_store;
pub mod prom_metrics;
pub mod server;
pub mod sweeper;
pub mod telemetry;
pub mod weights;

use crate::command::Command;
use crate::config::OrchestratorConfig;
use crate::db::Database;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::kv::{LiveRecord, RedisKv};
use crate::liveness::{IngestError, LivenessIndex, PushOutcome};
use crate::model_store::ModelStore;
use crate::telemetry::DeviceMetrics;
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

/// Shared orchestrator context, threaded through every component instead of
/// process-global handles. One per process; cheap to share via `Arc`.
pub struct Orchestra {
    pub db: Database,
    /// Redis mirror; `None` runs single-replica with in-memory state only.
    pub kv: Option<RedisKv>,
    pub liveness: Mutex<LivenessIndex>,
    pub store: std::sync::Arc<ModelStore>,
    pub events: EventBus,
    pub config: OrchestratorConfig,
    /// Most recent aggregate stats, stamped into heartbeat metadata.
    pub last_aggregate: Mutex<Option<AggregateSnapshot>>,
}

/// Summary of the latest closed round, surfaced to workers via heartbeat
/// response metadata.
#[derive(Clone, Debug)]
pub struct AggregateSnapshot {
    pub job_id: Uuid,
    pub round: u32,
    pub avg_loss: Option<f64>,
    pub avg_accuracy: Option<f64>,
}

impl Orchestra {
    pub fn new(
        db: Database,
        kv: Option<RedisKv>,
        store: std::sync::Arc<ModelStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Orchestra {
            db,
            kv,
            liveness: Mutex::new(LivenessIndex::new()),
            store,
            events: EventBus::new(),
            config,
            last_aggregate: Mutex::new(None),
        }
    }

    fn lock_liveness(&self) -> std::sync::MutexGuard<'_, LivenessIndex> {
        self.liveness.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a heartbeat in the local index and mirror it to Redis.
    /// The Redis write is best-effort; a failure degrades to local-only.
    pub async fn record_heartbeat(
        &self,
        device_id: Uuid,
        seq: u64,
        metrics: DeviceMetrics,
    ) -> Result<(), IngestError> {
        self.lock_liveness()
            .ingest(device_id, seq, metrics.clone(), Instant::now())?;
        if let Some(kv) = &self.kv {
            let record = LiveRecord {
                seq,
                received_at_ms: chrono::Utc::now().timestamp_millis() as u64,
                metrics,
            };
            if let Err(e) = kv
                .mirror_heartbeat(device_id, &record, self.config.liveness_ttl())
                .await
            {
                tracing::warn!(device_id = %device_id, error = %e, "liveness mirror failed");
            }
        }
        Ok(())
    }

    /// Liveness across both views: the local index or the Redis mirror.
    pub async fn is_live(&self, device_id: Uuid) -> bool {
        let local = self.lock_liveness().is_live(
            &device_id,
            Instant::now(),
            self.config.liveness_threshold(),
        );
        if local {
            return true;
        }
        if let Some(kv) = &self.kv {
            if let Ok(live) = kv.is_live(device_id).await {
                return live;
            }
        }
        false
    }

    /// Queue a command for a device. The shared Redis queue is preferred so
    /// any replica can deliver it; the local queue takes over when Redis is
    /// absent or unreachable.
    pub async fn enqueue_command(&self, device_id: Uuid, command: Command) -> Result<(), ApiError> {
        if let Some(kv) = &self.kv {
            match kv.push_command(device_id, &command.to_envelope()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e,
                        "shared command push failed, queueing locally");
                }
            }
        }
        match self.lock_liveness().push_command(device_id, command) {
            PushOutcome::Rejected => Err(ApiError::ResourceExhausted(format!(
                "command queue full for device {}",
                device_id
            ))),
            _ => Ok(()),
        }
    }

    /// Pop the next command for a device: shared queue first, then any
    /// locally queued leftovers from a Redis outage. Exactly one command is
    /// delivered per heartbeat response.
    pub async fn pop_command(&self, device_id: Uuid) -> Option<Command> {
        if let Some(kv) = &self.kv {
            match kv.pop_command(device_id).await {
                Ok(Some(env)) => {
                    if let Some(cmd) = Command::from_envelope(&env) {
                        return Some(cmd);
                    }
                    tracing::warn!(device_id = %device_id, kind = %env.kind,
                        "unparseable command in shared queue, skipping");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "shared command pop failed")
                }
            }
        }
        self.lock_liveness().pop_command(&device_id)
    }

    /// Drop a device from liveness tracking, locally and in Redis.
    pub async fn forget_device(&self, device_id: Uuid) {
        self.lock_liveness().remove(&device_id);
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.remove_live(device_id).await {
                tracing::warn!(device_id = %device_id, error = %e, "live key removal failed");
            }
        }
    }
}
