//! Training job, round, and submission operations.
//!
//! A job is a sequence of federated-averaging rounds. The coordinator task
//! that owns a job is the only writer of its round rows; workers append
//! submissions through the gradient-submit endpoint, guarded by the unique
//! `(job_id, round, device_id)` key so duplicates are detected in one
//! round-trip.
//!
//! ## Round retries
//!
//! A round that aborts is retried under the same round number with a bumped
//! `attempt`. The retry reuses the row (upsert keyed on `(job_id, round)`)
//! and starts from a clean submission slate.

use super::{Database, JobRow, JobStatus, RoundRow, RoundStatus, SubmissionRow};
use anyhow::Result;
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

const JOB_COLUMNS: &str = "job_id, architecture, initial_model_id, current_model_id, status,
                           error, current_round, target_rounds, quorum, round_timeout_s,
                           started_at, stopped_at";

const ROUND_COLUMNS: &str = "job_id, round, attempt, global_model_id, status, participants,
                             started_at, deadline, aggregate_model_id, avg_loss, avg_accuracy,
                             delta_norm";

impl Database {
    /// Create a training job in `running` state, starting at round 1.
    pub async fn create_job(
        &self,
        architecture: &str,
        initial_model_id: &str,
        target_rounds: u32,
        quorum: u32,
        round_timeout_s: u64,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (job_id, architecture, initial_model_id, current_model_id,
                               status, current_round, target_rounds, quorum, round_timeout_s,
                               started_at)
             VALUES ($1, $2, $3, $3, 'running', 0, $4, $5, $6, NOW())",
        )
        .bind(job_id)
        .bind(architecture)
        .bind(initial_model_id)
        .bind(target_rounds as i32)
        .bind(quorum as i32)
        .bind(round_timeout_s as i64)
        .execute(&self.pool)
        .await?;
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// List all jobs, most recent first.
    pub async fn list_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY started_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Jobs to resume after an orchestrator restart.
    pub async fn running_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_running_jobs(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Update a job's status. Sets `stopped_at` for terminal states.
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let stopped = status.is_terminal().then(chrono::Utc::now);
        sqlx::query(
            "UPDATE jobs SET status = $1, error = $2, stopped_at = COALESCE($3, stopped_at)
             WHERE job_id = $4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(stopped)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance the job head after a round closes: bump `current_round` and
    /// move the global model forward.
    pub async fn advance_job_round(
        &self,
        job_id: Uuid,
        current_round: u32,
        current_model_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET current_round = $1, current_model_id = $2 WHERE job_id = $3",
        )
        .bind(current_round as i32)
        .bind(current_model_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Rounds ──────────────────────────────────────────────────

    /// Open a round (or re-open it for a retry attempt). Clears any
    /// submissions left over from an aborted attempt in the same
    /// transaction so the fresh attempt starts clean.
    pub async fn open_round(
        &self,
        job_id: Uuid,
        round: u32,
        attempt: u32,
        global_model_id: &str,
        participants: &[Uuid],
        deadline: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM submissions WHERE job_id = $1 AND round = $2")
            .bind(job_id)
            .bind(round as i32)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO rounds (job_id, round, attempt, global_model_id, status,
                                 participants, started_at, deadline)
             VALUES ($1, $2, $3, $4, 'open', $5, NOW(), $6)
             ON CONFLICT (job_id, round) DO UPDATE SET
               attempt = EXCLUDED.attempt,
               global_model_id = EXCLUDED.global_model_id,
               status = 'open',
               participants = EXCLUDED.participants,
               started_at = NOW(),
               deadline = EXCLUDED.deadline,
               aggregate_model_id = NULL,
               avg_loss = NULL, avg_accuracy = NULL, delta_norm = NULL",
        )
        .bind(job_id)
        .bind(round as i32)
        .bind(attempt as i32)
        .bind(global_model_id)
        .bind(Json(participants))
        .bind(deadline)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_round_status(
        &self,
        job_id: Uuid,
        round: u32,
        status: RoundStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE rounds SET status = $1 WHERE job_id = $2 AND round = $3")
            .bind(status.as_str())
            .bind(job_id)
            .bind(round as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close a round with its aggregate result and advance the job head,
    /// atomically.
    pub async fn close_round(
        &self,
        job_id: Uuid,
        round: u32,
        aggregate_model_id: &str,
        avg_loss: Option<f64>,
        avg_accuracy: Option<f64>,
        delta_norm: f64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE rounds SET status = 'closed', aggregate_model_id = $1,
                    avg_loss = $2, avg_accuracy = $3, delta_norm = $4
             WHERE job_id = $5 AND round = $6",
        )
        .bind(aggregate_model_id)
        .bind(avg_loss)
        .bind(avg_accuracy)
        .bind(delta_norm)
        .bind(job_id)
        .bind(round as i32)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE jobs SET current_round = $1, current_model_id = $2 WHERE job_id = $3",
        )
        .bind(round as i32)
        .bind(aggregate_model_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_round(&self, job_id: Uuid, round: u32) -> Result<Option<RoundRow>> {
        let row = sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE job_id = $1 AND round = $2"
        ))
        .bind(job_id)
        .bind(round as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_rounds(&self, job_id: Uuid) -> Result<Vec<RoundRow>> {
        let rows = sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE job_id = $1 ORDER BY round"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Devices participating in any currently open round. Used by the
    /// eligibility filter to exclude already-assigned workers.
    pub async fn busy_devices(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Json<Vec<Uuid>>,)> = sqlx::query_as(
            "SELECT r.participants FROM rounds r
             JOIN jobs j ON j.job_id = r.job_id
             WHERE r.status = 'open' AND j.status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut ids: Vec<Uuid> = rows.into_iter().flat_map(|(Json(p),)| p).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    // ── Submissions ─────────────────────────────────────────────

    /// Insert a submission. Returns false when this device already
    /// submitted for this round (the unique key absorbs the race).
    pub async fn insert_submission(
        &self,
        job_id: Uuid,
        round: u32,
        device_id: Uuid,
        blob: &[u8],
        num_samples: u64,
        metrics: &HashMap<String, f64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO submissions (job_id, round, device_id, blob, num_samples, metrics,
                                      received_at)
             VALUES ($1, $2, $3, $4, $5, $6, NOW())
             ON CONFLICT (job_id, round, device_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(round as i32)
        .bind(device_id)
        .bind(blob)
        .bind(num_samples as i64)
        .bind(Json(metrics))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_submissions(&self, job_id: Uuid, round: u32) -> Result<Vec<SubmissionRow>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(
            "SELECT job_id, round, device_id, blob, num_samples, metrics, received_at
             FROM submissions WHERE job_id = $1 AND round = $2
             ORDER BY device_id",
        )
        .bind(job_id)
        .bind(round as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_submissions(&self, job_id: Uuid, round: u32) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM submissions WHERE job_id = $1 AND round = $2",
        )
        .bind(job_id)
        .bind(round as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Which of the given devices already submitted for a round.
    pub async fn submitted_devices(&self, job_id: Uuid, round: u32) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT device_id FROM submissions WHERE job_id = $1 AND round = $2",
        )
        .bind(job_id)
        .bind(round as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
