//! # KV — Redis Mirror for Liveness and Command Queues
//!
//! The in-process [`crate::liveness::LivenessIndex`] is authoritative for
//! the replica that owns a heartbeat stream; this module mirrors that state
//! into Redis so sibling orchestrator replicas (and the admin surface) see
//! it too:
//!
//! - `live:{device_id}` → JSON `{seq, received_at_ms, metrics}`, with a TTL
//!   of three heartbeat intervals. Key presence *is* liveness.
//! - `cmdq:{device_id}` → FIFO list of command envelopes, bounded to 32.
//!   Overflow drops the oldest entry unless it is a `shutdown`.
//!
//! All mirror operations are best-effort: a Redis outage degrades the
//! orchestrator to single-replica operation (warned, not fatal).

use crate::command::CommandEnvelope;
use crate::telemetry::DeviceMetrics;
use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Queue bound shared with the in-memory index.
const QUEUE_CAP: usize = 32;

/// The value stored under `live:{device_id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveRecord {
    pub seq: u64,
    pub received_at_ms: u64,
    pub metrics: DeviceMetrics,
}

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

fn live_key(device_id: &Uuid) -> String {
    format!("live:{}", device_id)
}

fn cmdq_key(device_id: &Uuid) -> String {
    format!("cmdq:{}", device_id)
}

impl RedisKv {
    /// Connect and verify with a PING.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("parsing redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        let kv = RedisKv { conn };
        kv.ping().await?;
        tracing::info!("redis connection established");
        Ok(kv)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        anyhow::ensure!(pong == "PONG", "unexpected PING response: {}", pong);
        Ok(())
    }

    /// Mirror a heartbeat under `live:{device_id}` with the given TTL.
    pub async fn mirror_heartbeat(
        &self,
        device_id: Uuid,
        record: &LiveRecord,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(record)?;
        let _: () = conn
            .set_ex(live_key(&device_id), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// Liveness across replicas: the key exists iff a heartbeat arrived
    /// within the TTL window.
    pub async fn is_live(&self, device_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(live_key(&device_id)).await?;
        Ok(exists)
    }

    pub async fn get_live(&self, device_id: Uuid) -> Result<Option<LiveRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(live_key(&device_id)).await?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    /// Remove the liveness key (sweeper, unregister).
    pub async fn remove_live(&self, device_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(live_key(&device_id)).await?;
        Ok(())
    }

    /// Append a command to the device's shared queue. Enforces the bound by
    /// dropping the oldest entry — unless the oldest is a durable
    /// `shutdown`, which is pushed back to the head.
    pub async fn push_command(&self, device_id: Uuid, env: &CommandEnvelope) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = cmdq_key(&device_id);
        let len: usize = conn.llen(&key).await?;
        if len >= QUEUE_CAP {
            let dropped: Option<String> = conn.lpop(&key, None).await?;
            if let Some(old) = dropped {
                let is_shutdown = serde_json::from_str::<CommandEnvelope>(&old)
                    .map(|e| e.kind == "shutdown")
                    .unwrap_or(false);
                if is_shutdown {
                    let _: () = conn.lpush(&key, old).await?;
                } else {
                    tracing::warn!(device_id = %device_id, "shared command queue full, dropped oldest");
                }
            }
        }
        let value = serde_json::to_string(env)?;
        let _: () = conn.rpush(&key, value).await?;
        Ok(())
    }

    /// Pop the next command for a device; one per heartbeat response.
    pub async fn pop_command(&self, device_id: Uuid) -> Result<Option<CommandEnvelope>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.lpop(cmdq_key(&device_id), None).await?;
        match value {
            Some(v) => Ok(serde_json::from_str(&v).ok()),
            None => Ok(None),
        }
    }

    pub async fn queue_len(&self, device_id: Uuid) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(cmdq_key(&device_id)).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_device() {
        let id = Uuid::nil();
        assert_eq!(
            live_key(&id),
            "live:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            cmdq_key(&id),
            "cmdq:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn live_record_json_roundtrip() {
        let record = LiveRecord {
            seq: 42,
            received_at_ms: 1_700_000_000_000,
            metrics: DeviceMetrics {
                battery_level: 0.8,
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: LiveRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 42);
        assert_eq!(back.metrics.battery_level, 0.8);
    }
}
