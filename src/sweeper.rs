//! # Sweeper — Stale-Device Downgrade Task
//!
//! Devices are expected to heartbeat every `heartbeat_interval`; one that
//! misses `miss_threshold` consecutive intervals is downgraded to `offline`
//! in the registry, dropped from the liveness index and the Redis mirror,
//! and announced as a `device_offline` event so the coordinator can treat
//! it as a straggler.
//!
//! The sweep is idempotent: a second pass over the same state changes
//! nothing, because the registry update only touches rows still marked
//! `online`/`training`.

use crate::events::Event;
use crate::Orchestra;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// The registry cutoff: anything last seen before this is stale.
fn cutoff(
    now: chrono::DateTime<chrono::Utc>,
    threshold: std::time::Duration,
) -> chrono::DateTime<chrono::Utc> {
    now - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero())
}

/// One sweep pass. Returns the devices downgraded this pass.
pub async fn sweep_once(ctx: &Orchestra) -> Result<Vec<Uuid>> {
    let threshold = ctx.config.liveness_threshold();
    let stale = ctx
        .db
        .mark_devices_offline(cutoff(chrono::Utc::now(), threshold))
        .await?;
    for device_id in &stale {
        ctx.forget_device(*device_id).await;
        ctx.events.emit(Event::DeviceOffline {
            device_id: *device_id,
        });
    }
    // Tidy local entries for devices the registry never knew about
    // (e.g. heartbeats that raced an unregister).
    let expired = {
        let mut liveness = ctx.liveness.lock().unwrap();
        liveness.sweep(Instant::now(), threshold)
    };
    for device_id in expired {
        if !stale.contains(&device_id) {
            if let Some(kv) = &ctx.kv {
                kv.remove_live(device_id).await.ok();
            }
        }
    }
    Ok(stale)
}

/// Background task: sweep on the configured period until the process exits.
pub async fn run(ctx: Arc<Orchestra>) {
    let mut interval = tokio::time::interval(ctx.config.sweep_interval());
    interval.tick().await;
    loop {
        interval.tick().await;
        match sweep_once(&ctx).await {
            Ok(stale) if !stale.is_empty() => {
                tracing::info!(count = stale.len(), "swept stale devices offline");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "device sweep failed");
            }
        }
    }
}
