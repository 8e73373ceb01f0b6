//! # Events — Orchestrator Event Bus
//!
//! A bounded, thread-safe event log plus a broadcast channel. Components
//! emit lifecycle events; the coordinator subscribes for `DeviceOffline`
//! (straggler handling), and the recent buffer backs the events API.
//!
//! | Variant | Emitted When |
//! |---------|-------------|
//! | `DeviceOffline` | Sweeper downgrades a device past the miss threshold |
//! | `RoundOpened` | Coordinator dispatches `start_training` to participants |
//! | `RoundAggregated` | A round's submissions were averaged into a new model |
//! | `RoundAborted` | Deadline/quorum failure or aggregator error |
//! | `JobCompleted` / `JobFailed` | Terminal job transitions |
//! | `SubmissionRejected` | Bad blob, duplicate, or late submission |
//! | `Warning` | Non-fatal conditions (queue overflow, Redis degraded) |

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

const RECENT_EVENTS_CAP: usize = 200;
const BROADCAST_CAP: usize = 256;

/// Events emitted by orchestrator components.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    DeviceOffline {
        device_id: Uuid,
    },
    RoundOpened {
        job_id: Uuid,
        round: u32,
        participants: Vec<Uuid>,
    },
    RoundAggregated {
        job_id: Uuid,
        round: u32,
        model_id: String,
        delta_norm: f64,
    },
    RoundAborted {
        job_id: Uuid,
        round: u32,
        cause: String,
    },
    JobCompleted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        reason: String,
    },
    SubmissionRejected {
        job_id: Uuid,
        device_id: Uuid,
        round: u32,
        reason: String,
    },
    Warning {
        context: String,
        message: String,
    },
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::DeviceOffline { .. } => "device_offline",
            Event::RoundOpened { .. } => "round_opened",
            Event::RoundAggregated { .. } => "round_aggregated",
            Event::RoundAborted { .. } => "round_aborted",
            Event::JobCompleted { .. } => "job_completed",
            Event::JobFailed { .. } => "job_failed",
            Event::SubmissionRejected { .. } => "submission_rejected",
            Event::Warning { .. } => "warning",
        }
    }
}

/// A logged event with a monotonic id for cursor-based reads.
#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub kind: String,
    pub event: Event,
}

/// Central event bus: components emit, the coordinator and API consume.
pub struct EventBus {
    recent: Mutex<VecDeque<EventRecord>>,
    next_id: AtomicU64,
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(BROADCAST_CAP);
        EventBus {
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAP)),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Subscribe to the live event stream (one receiver per consumer).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event: log it, buffer it, broadcast it.
    pub fn emit(&self, event: Event) {
        match &event {
            Event::Warning { context, message } => {
                tracing::warn!(context = %context, "{}", message)
            }
            Event::RoundAborted { job_id, round, cause } => {
                tracing::warn!(job_id = %job_id, round, cause = %cause, "round aborted")
            }
            Event::JobFailed { job_id, reason } => {
                tracing::warn!(job_id = %job_id, reason = %reason, "job failed")
            }
            other => tracing::info!(event = ?other, "orchestra event"),
        }

        let record = EventRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: event.kind().to_string(),
            event: event.clone(),
        };
        {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() >= RECENT_EVENTS_CAP {
                recent.pop_front();
            }
            recent.push_back(record);
        }
        // No receivers is fine — the bus is fire-and-forget
        let _ = self.tx.send(event);
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let recent = self.recent.lock().unwrap();
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Events with id greater than `after`, oldest first.
    pub fn recent_since(&self, after: u64, limit: usize) -> Vec<EventRecord> {
        let recent = self.recent.lock().unwrap();
        recent
            .iter()
            .filter(|r| r.id > after)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline(id: Uuid) -> Event {
        Event::DeviceOffline { device_id: id }
    }

    #[test]
    fn new_bus_has_no_events() {
        let bus = EventBus::new();
        assert!(bus.recent(100).is_empty());
    }

    #[test]
    fn emit_records_event() {
        let bus = EventBus::new();
        bus.emit(offline(Uuid::new_v4()));
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "device_offline");
    }

    #[test]
    fn recent_is_newest_first() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        bus.emit(offline(a));
        bus.emit(offline(b));
        let recent = bus.recent(10);
        match &recent[0].event {
            Event::DeviceOffline { device_id } => assert_eq!(*device_id, b),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn recent_capped() {
        let bus = EventBus::new();
        for _ in 0..250 {
            bus.emit(offline(Uuid::new_v4()));
        }
        assert_eq!(bus.recent(500).len(), RECENT_EVENTS_CAP);
    }

    #[test]
    fn recent_since_returns_only_newer() {
        let bus = EventBus::new();
        bus.emit(offline(Uuid::new_v4()));
        bus.emit(offline(Uuid::new_v4()));
        let all = bus.recent_since(0, 100);
        assert_eq!(all.len(), 2);
        let newer = bus.recent_since(all[0].id, 100);
        assert_eq!(newer.len(), 1);
        assert!(newer[0].id > all[0].id);
    }

    #[tokio::test]
    async fn subscribers_receive_broadcast() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.emit(offline(id));
        match rx.recv().await.unwrap() {
            Event::DeviceOffline { device_id } => assert_eq!(device_id, id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::Warning {
            context: "kv".into(),
            message: "redis unreachable".into(),
        });
        assert_eq!(bus.recent(1).len(), 1);
    }

    #[test]
    fn ids_monotonic() {
        let bus = EventBus::new();
        bus.emit(offline(Uuid::new_v4()));
        bus.emit(offline(Uuid::new_v4()));
        let recent = bus.recent(2);
        assert!(recent[0].id > recent[1].id);
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Event::JobCompleted {
            job_id: Uuid::nil(),
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"job_completed\""));
    }
}
