//! Device registry — registration, touch, listing, offline sweeps.
//!
//! The authoritative record of every worker the orchestrator has ever seen.
//! Heartbeats call `touch_device` on every request; the sweeper calls
//! `mark_devices_offline` on its period. Unregistration preserves the row
//! (history matters for round attribution) and flips status to `offline`.

use super::{Database, DeviceCapabilities, DeviceFilter, DeviceRow, DeviceStatus};
use crate::telemetry::DeviceMetrics;
use anyhow::Result;
use sqlx::types::Json;
use uuid::Uuid;

const DEVICE_COLUMNS: &str = "device_id, name, device_model, os_version, capabilities,
                              status, last_metrics, registered_at, last_seen_at";

impl Database {
    /// Register a new device and return its server-assigned id.
    ///
    /// Names are not unique — two devices registering with the same name get
    /// distinct ids and distinct rows.
    pub async fn register_device(
        &self,
        name: &str,
        device_model: &str,
        os_version: &str,
        capabilities: &DeviceCapabilities,
        initial_metrics: &DeviceMetrics,
    ) -> Result<Uuid> {
        let device_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO devices (device_id, name, device_model, os_version, capabilities,
                                  status, last_metrics, registered_at, last_seen_at)
             VALUES ($1, $2, $3, $4, $5, 'online', $6, NOW(), NOW())",
        )
        .bind(device_id)
        .bind(name)
        .bind(device_model)
        .bind(os_version)
        .bind(Json(capabilities))
        .bind(Json(initial_metrics))
        .execute(&self.pool)
        .await?;
        Ok(device_id)
    }

    /// Unregister: flip to offline, keep the row for history.
    /// Returns false when the id is unknown.
    pub async fn unregister_device(&self, device_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE devices SET status = 'offline' WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_device(&self, device_id: Uuid) -> Result<Option<DeviceRow>> {
        let row = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = $1"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// List devices, optionally filtered by status and supported framework.
    pub async fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<DeviceRow>> {
        let rows = sqlx::query_as::<_, DeviceRow>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR capabilities->'supported_frameworks' ? $2)
             ORDER BY registered_at"
        ))
        .bind(filter.status.as_deref())
        .bind(filter.framework.as_deref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Record a heartbeat: update metrics, status, and `last_seen_at`.
    /// Returns false when the id is unknown.
    ///
    /// A `training` device stays `training` when the caller passes `online`
    /// — heartbeats must not clobber an active round assignment; only the
    /// coordinator (or the sweeper) moves a device out of `training`.
    pub async fn touch_device(
        &self,
        device_id: Uuid,
        metrics: &DeviceMetrics,
        status: DeviceStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET last_metrics = $1,
                    status = CASE WHEN status = 'training' AND $2 = 'online'
                                  THEN status ELSE $2 END,
                    last_seen_at = NOW()
             WHERE device_id = $3",
        )
        .bind(Json(metrics))
        .bind(status.as_str())
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_device_status(&self, device_id: Uuid, status: DeviceStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE devices SET status = $1 WHERE device_id = $2")
            .bind(status.as_str())
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return a device from `training` to `online` when its round ends.
    /// A device the sweeper already downgraded stays `offline`.
    pub async fn release_training_device(&self, device_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET status = 'online' WHERE device_id = $1 AND status = 'training'",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Downgrade devices that have not been seen since `cutoff` and are
    /// still marked online/training. Returns the ids transitioned, so the
    /// sweeper can publish `device_offline` events. Idempotent.
    pub async fn mark_devices_offline(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE devices SET status = 'offline'
             WHERE status IN ('online', 'training') AND last_seen_at < $1
             RETURNING device_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Per-status device counts for the Prometheus gauges.
    pub async fn count_devices_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM devices GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}
