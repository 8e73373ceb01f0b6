//! # Config — Orchestrator Tuning Knobs
//!
//! All timing and threshold options recognized by the orchestrator, with the
//! defaults used in production. The CLI builds one of these from flags and
//! environment variables and threads it through every component constructor
//! (no process-global config).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval_s: u64,
    /// Heartbeats a device may miss before it is considered stale.
    pub miss_threshold: u32,
    /// How often the stale-device sweeper runs.
    pub sweep_interval_s: u64,
    /// Soft deadline for collecting round submissions.
    pub round_timeout_s: u64,
    /// Extra grace past the deadline before the round is forced closed.
    pub round_grace_s: u64,
    /// Minimum submissions required to aggregate a round.
    pub quorum_min: usize,
    /// Wait between participant-selection attempts while under quorum.
    pub selection_backoff_s: u64,
    /// Selection attempts before the job fails.
    pub selection_max_attempts: u32,
    /// Aborted-round retries before the job fails.
    pub round_max_retries: u32,
    /// Minimum battery level for round eligibility.
    pub battery_floor: f64,
    /// Maximum thermal pressure for round eligibility.
    pub thermal_ceiling: f64,
    /// Model download chunk size in bytes.
    pub chunk_size_bytes: usize,
    /// Age past which unreferenced model blobs are collected.
    pub blob_retention_s: u64,
    /// Directory for content-addressed model blobs.
    pub blob_dir: PathBuf,
    /// When set, every API and heartbeat call must present this x-api-key.
    pub api_key: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            heartbeat_interval_s: 5,
            miss_threshold: 3,
            sweep_interval_s: 30,
            round_timeout_s: 300,
            round_grace_s: 60,
            quorum_min: 1,
            selection_backoff_s: 15,
            selection_max_attempts: 8,
            round_max_retries: 3,
            battery_floor: 0.30,
            thermal_ceiling: 0.70,
            chunk_size_bytes: 1_048_576,
            blob_retention_s: 86_400,
            blob_dir: PathBuf::from("./models"),
            api_key: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    /// A device is stale once this much time passes without a heartbeat.
    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s * self.miss_threshold as u64)
    }

    /// TTL for `live:` keys in the shared KV store.
    pub fn liveness_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s * 3)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_s)
    }

    pub fn round_grace(&self) -> Duration {
        Duration::from_secs(self.round_grace_s)
    }

    pub fn selection_backoff(&self) -> Duration {
        Duration::from_secs(self.selection_backoff_s)
    }

    pub fn blob_retention(&self) -> Duration {
        Duration::from_secs(self.blob_retention_s)
    }
}
