//! # Liveness — In-Memory Heartbeat Index
//!
//! Tracks the last heartbeat, latest metrics, and pending command queue for
//! every device this orchestrator replica has heard from. Heartbeat sessions
//! call [`LivenessIndex::ingest`] on every request; the coordinator reads
//! [`LivenessIndex::live_snapshot`] when selecting round participants.
//!
//! Entries here are ephemeral: lost on restart, rebuilt from the next
//! heartbeat. The Redis mirror in [`crate::kv`] makes liveness and command
//! queues visible across replicas; this index is the always-available local
//! view and the fallback when Redis is down.
//!
//! ## Stale-Stream Defense
//!
//! Each device sends a monotonically increasing `seq` with its heartbeats.
//! A request whose `seq` does not advance past the stored one is rejected —
//! it belongs to a zombie stream from a previous session.
//!
//! ## Pending Commands
//!
//! Commands are FIFO per device, bounded to [`COMMAND_QUEUE_CAP`]. Overflow
//! drops the oldest droppable entry with a warning; `shutdown` is durable
//! and never dropped.

use crate::command::Command;
use crate::telemetry::DeviceMetrics;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Maximum queued commands per device.
pub const COMMAND_QUEUE_CAP: usize = 32;

/// Latest heartbeat state for one device.
#[derive(Clone, Debug)]
pub struct LiveEntry {
    pub seq: u64,
    pub received_at: Instant,
    pub metrics: DeviceMetrics,
}

/// Outcome of pushing a command onto a device queue.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest droppable command was discarded.
    DroppedOldest,
    /// Queue is full of durable commands; the new command was refused.
    Rejected,
}

/// Heartbeat ingest failure.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestError {
    /// `seq` did not advance past the stored value (zombie stream).
    StaleSequence { stored: u64, got: u64 },
}

#[derive(Default)]
pub struct LivenessIndex {
    entries: HashMap<Uuid, LiveEntry>,
    queues: HashMap<Uuid, VecDeque<Command>>,
}

impl LivenessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat. Rejects sequence numbers that do not advance.
    pub fn ingest(
        &mut self,
        device_id: Uuid,
        seq: u64,
        metrics: DeviceMetrics,
        now: Instant,
    ) -> Result<(), IngestError> {
        if let Some(existing) = self.entries.get(&device_id) {
            if seq <= existing.seq {
                return Err(IngestError::StaleSequence {
                    stored: existing.seq,
                    got: seq,
                });
            }
        }
        self.entries.insert(
            device_id,
            LiveEntry {
                seq,
                received_at: now,
                metrics: metrics.clamped(),
            },
        );
        Ok(())
    }

    /// A device is live iff it heartbeated within `threshold`.
    pub fn is_live(&self, device_id: &Uuid, now: Instant, threshold: Duration) -> bool {
        self.entries
            .get(device_id)
            .map(|e| now.duration_since(e.received_at) <= threshold)
            .unwrap_or(false)
    }

    pub fn get(&self, device_id: &Uuid) -> Option<&LiveEntry> {
        self.entries.get(device_id)
    }

    /// All devices currently within the liveness threshold, with metrics.
    pub fn live_snapshot(&self, now: Instant, threshold: Duration) -> Vec<(Uuid, LiveEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.received_at) <= threshold)
            .map(|(id, e)| (*id, e.clone()))
            .collect()
    }

    /// Queue a command for delivery on the device's next heartbeat.
    pub fn push_command(&mut self, device_id: Uuid, command: Command) -> PushOutcome {
        let queue = self.queues.entry(device_id).or_default();
        if queue.len() < COMMAND_QUEUE_CAP {
            queue.push_back(command);
            return PushOutcome::Queued;
        }
        match queue.iter().position(|c| !c.is_durable()) {
            Some(idx) => {
                let dropped = queue.remove(idx);
                tracing::warn!(
                    device_id = %device_id,
                    dropped = dropped.map(|c| c.kind()).unwrap_or("?"),
                    "command queue full, dropped oldest"
                );
                queue.push_back(command);
                PushOutcome::DroppedOldest
            }
            None => PushOutcome::Rejected,
        }
    }

    /// Pop the next queued command, if any. One per heartbeat response.
    pub fn pop_command(&mut self, device_id: &Uuid) -> Option<Command> {
        self.queues.get_mut(device_id).and_then(VecDeque::pop_front)
    }

    pub fn queue_len(&self, device_id: &Uuid) -> usize {
        self.queues.get(device_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Forget a device entirely (sweeper / unregister).
    pub fn remove(&mut self, device_id: &Uuid) {
        self.entries.remove(device_id);
        self.queues.remove(device_id);
    }

    /// Drop entries older than `threshold`; returns the expired device ids.
    pub fn sweep(&mut self, now: Instant, threshold: Duration) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.received_at) > threshold)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StartTraining;

    const THRESHOLD: Duration = Duration::from_secs(15);

    fn device() -> Uuid {
        Uuid::new_v4()
    }

    fn metrics() -> DeviceMetrics {
        DeviceMetrics {
            battery_level: 0.9,
            ..Default::default()
        }
    }

    #[test]
    fn ingest_then_live() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let now = Instant::now();
        idx.ingest(id, 1, metrics(), now).unwrap();
        assert!(idx.is_live(&id, now, THRESHOLD));
    }

    #[test]
    fn unknown_device_not_live() {
        let idx = LivenessIndex::new();
        assert!(!idx.is_live(&device(), Instant::now(), THRESHOLD));
    }

    #[test]
    fn stale_sequence_rejected() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let now = Instant::now();
        idx.ingest(id, 5, metrics(), now).unwrap();
        let err = idx.ingest(id, 5, metrics(), now).unwrap_err();
        assert_eq!(err, IngestError::StaleSequence { stored: 5, got: 5 });
        let err = idx.ingest(id, 3, metrics(), now).unwrap_err();
        assert_eq!(err, IngestError::StaleSequence { stored: 5, got: 3 });
    }

    #[test]
    fn sequence_gaps_allowed() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let now = Instant::now();
        idx.ingest(id, 1, metrics(), now).unwrap();
        idx.ingest(id, 100, metrics(), now).unwrap();
        assert_eq!(idx.get(&id).unwrap().seq, 100);
    }

    #[test]
    fn device_expires_after_threshold() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let t0 = Instant::now();
        idx.ingest(id, 1, metrics(), t0).unwrap();
        let later = t0 + THRESHOLD + Duration::from_secs(1);
        assert!(!idx.is_live(&id, later, THRESHOLD));
    }

    #[test]
    fn sweep_removes_and_reports_expired() {
        let mut idx = LivenessIndex::new();
        let stale = device();
        let fresh = device();
        let t0 = Instant::now();
        idx.ingest(stale, 1, metrics(), t0).unwrap();
        let t1 = t0 + Duration::from_secs(20);
        idx.ingest(fresh, 1, metrics(), t1).unwrap();

        let expired = idx.sweep(t1, THRESHOLD);
        assert_eq!(expired, vec![stale]);
        assert!(idx.get(&stale).is_none());
        assert!(idx.is_live(&fresh, t1, THRESHOLD));
    }

    #[test]
    fn sweep_is_idempotent() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let t0 = Instant::now();
        idx.ingest(id, 1, metrics(), t0).unwrap();
        let later = t0 + Duration::from_secs(60);
        assert_eq!(idx.sweep(later, THRESHOLD).len(), 1);
        assert!(idx.sweep(later, THRESHOLD).is_empty());
    }

    #[test]
    fn commands_fifo_one_per_pop() {
        let mut idx = LivenessIndex::new();
        let id = device();
        idx.push_command(id, Command::Ack);
        idx.push_command(id, Command::Shutdown);
        assert_eq!(idx.pop_command(&id), Some(Command::Ack));
        assert_eq!(idx.pop_command(&id), Some(Command::Shutdown));
        assert_eq!(idx.pop_command(&id), None);
    }

    #[test]
    fn queue_overflow_drops_oldest_droppable() {
        let mut idx = LivenessIndex::new();
        let id = device();
        for i in 0..COMMAND_QUEUE_CAP {
            assert_eq!(
                idx.push_command(id, Command::UpdateInterval { seconds: i as u32 }),
                PushOutcome::Queued
            );
        }
        let outcome = idx.push_command(id, Command::StopTraining { job_id: "j".into() });
        assert_eq!(outcome, PushOutcome::DroppedOldest);
        assert_eq!(idx.queue_len(&id), COMMAND_QUEUE_CAP);
        // Oldest (seconds: 0) is gone
        assert_eq!(
            idx.pop_command(&id),
            Some(Command::UpdateInterval { seconds: 1 })
        );
    }

    #[test]
    fn shutdown_survives_overflow() {
        let mut idx = LivenessIndex::new();
        let id = device();
        idx.push_command(id, Command::Shutdown);
        for i in 0..(COMMAND_QUEUE_CAP - 1) {
            idx.push_command(id, Command::UpdateInterval { seconds: i as u32 });
        }
        idx.push_command(id, Command::Ack);
        // Shutdown was oldest but durable; the first update_interval went instead
        assert_eq!(idx.pop_command(&id), Some(Command::Shutdown));
    }

    #[test]
    fn queue_of_durables_rejects_new() {
        let mut idx = LivenessIndex::new();
        let id = device();
        for _ in 0..COMMAND_QUEUE_CAP {
            idx.push_command(id, Command::Shutdown);
        }
        assert_eq!(idx.push_command(id, Command::Ack), PushOutcome::Rejected);
    }

    #[test]
    fn remove_clears_entry_and_queue() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let now = Instant::now();
        idx.ingest(id, 1, metrics(), now).unwrap();
        idx.push_command(id, Command::Shutdown);
        idx.remove(&id);
        assert!(!idx.is_live(&id, now, THRESHOLD));
        assert_eq!(idx.pop_command(&id), None);
    }

    #[test]
    fn live_snapshot_filters_by_threshold() {
        let mut idx = LivenessIndex::new();
        let old = device();
        let new = device();
        let t0 = Instant::now();
        idx.ingest(old, 1, metrics(), t0).unwrap();
        let t1 = t0 + Duration::from_secs(30);
        idx.ingest(new, 1, metrics(), t1).unwrap();
        let snapshot = idx.live_snapshot(t1, THRESHOLD);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, new);
    }

    #[test]
    fn ingest_clamps_metrics() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let m = DeviceMetrics {
            battery_level: 3.0,
            ..Default::default()
        };
        idx.ingest(id, 1, m, Instant::now()).unwrap();
        assert_eq!(idx.get(&id).unwrap().metrics.battery_level, 1.0);
    }

    #[test]
    fn start_training_command_preserved_through_queue() {
        let mut idx = LivenessIndex::new();
        let id = device();
        let cmd = Command::StartTraining(StartTraining {
            job_id: "job-1".into(),
            model_id: "m".into(),
            round: 1,
            partition_index: 0,
            partition_total: 3,
            architecture: "cnn".into(),
        });
        idx.push_command(id, cmd.clone());
        assert_eq!(idx.pop_command(&id), Some(cmd));
    }
}
