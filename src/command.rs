//! # Command — Typed Envelope for Heartbeat-Delivered Commands
//!
//! The wire representation of a command is loose (`type` + string maps, so
//! old workers can skip fields they don't understand); the coordinator and
//! API handlers construct and parse commands exactly once through this
//! typed envelope. Commands are delivered to a device in its next heartbeat
//! response and are idempotent by `(job_id, round)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters of a `start_training` command. One per participant per round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTraining {
    pub job_id: String,
    pub model_id: String,
    pub round: u32,
    pub partition_index: u32,
    pub partition_total: u32,
    pub architecture: String,
}

/// A command queued for delivery to a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Ack,
    /// Ask the worker to switch to a new heartbeat interval (seconds).
    UpdateInterval { seconds: u32 },
    StartTraining(StartTraining),
    StopTraining { job_id: String },
    Shutdown,
}

/// Wire form of a command: what actually travels in a heartbeat response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Ack => "ack",
            Command::UpdateInterval { .. } => "update_interval",
            Command::StartTraining(_) => "start_training",
            Command::StopTraining { .. } => "stop_training",
            Command::Shutdown => "shutdown",
        }
    }

    /// Shutdown survives queue overflow; everything else may be dropped.
    pub fn is_durable(&self) -> bool {
        matches!(self, Command::Shutdown)
    }

    pub fn to_envelope(&self) -> CommandEnvelope {
        let mut parameters = BTreeMap::new();
        match self {
            Command::Ack | Command::Shutdown => {}
            Command::UpdateInterval { seconds } => {
                parameters.insert("interval_s".into(), seconds.to_string());
            }
            Command::StartTraining(st) => {
                parameters.insert("job_id".into(), st.job_id.clone());
                parameters.insert("model_id".into(), st.model_id.clone());
                parameters.insert("round".into(), st.round.to_string());
                parameters.insert("partition_index".into(), st.partition_index.to_string());
                parameters.insert("partition_total".into(), st.partition_total.to_string());
                parameters.insert("architecture".into(), st.architecture.clone());
            }
            Command::StopTraining { job_id } => {
                parameters.insert("job_id".into(), job_id.clone());
            }
        }
        CommandEnvelope {
            kind: self.kind().to_string(),
            parameters,
            metadata: BTreeMap::new(),
        }
    }

    /// Parse a wire envelope back into a typed command.
    ///
    /// Returns `None` for unknown kinds or missing/malformed parameters —
    /// callers treat that as a protocol error, not a panic.
    pub fn from_envelope(env: &CommandEnvelope) -> Option<Command> {
        fn param<'a>(env: &'a CommandEnvelope, key: &str) -> Option<&'a str> {
            env.parameters.get(key).map(String::as_str)
        }
        match env.kind.as_str() {
            "ack" => Some(Command::Ack),
            "shutdown" => Some(Command::Shutdown),
            "update_interval" => {
                let seconds = param(env, "interval_s")?.parse().ok()?;
                Some(Command::UpdateInterval { seconds })
            }
            "stop_training" => Some(Command::StopTraining {
                job_id: param(env, "job_id")?.to_string(),
            }),
            "start_training" => Some(Command::StartTraining(StartTraining {
                job_id: param(env, "job_id")?.to_string(),
                model_id: param(env, "model_id")?.to_string(),
                round: param(env, "round")?.parse().ok()?,
                partition_index: param(env, "partition_index")?.parse().ok()?,
                partition_total: param(env, "partition_total")?.parse().ok()?,
                architecture: param(env, "architecture")?.to_string(),
            })),
            _ => None,
        }
    }
}
