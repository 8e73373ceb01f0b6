//! # Coordinator — Training Job Round State Machine
//!
//! One [`JobRunner`] task per running job drives that job's rounds:
//!
//! ```text
//! forming ──(≥ quorum eligible)──▶ open ──(submissions)──▶ aggregating ──▶ closed
//!    │  ▲                           │                          │
//!    │  └── selection backoff       └──(quorum miss)──▶ aborted┘ (retry w/ re-selection)
//!    ▼
//!  job failed (selection attempts exhausted)
//! ```
//!
//! The transition rules ([`evaluate_round`], [`select_participants`]) are
//! pure functions over explicit inputs, so the state machine's behavior is
//! testable without a database or clock tricks; the runner is a thin async
//! driver that persists every transition and reacts to `device_offline`
//! events for straggler handling.
//!
//! The runner is the single writer of its job's round rows. External
//! cancellation flips the job row to `cancelled`; the runner observes that
//! at its next poll, tears down, and stops the fleet.

use crate::aggregator::{self, AggregateError, SubmissionInput};
use crate::command::{Command, StartTraining};
use crate::config::OrchestratorConfig;
use crate::db::{DeviceStatus, JobRow, JobStatus, RoundStatus};
use crate::events::Event;
use crate::telemetry::DeviceMetrics;
use crate::Orchestra;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How often the runner re-checks submissions, events, and cancellation.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on participants drafted into one round. Rounds stay useful
/// well below this; it caps command fan-out and aggregate memory.
pub const PARTICIPANT_CAP: usize = 32;

// ── Participant selection ───────────────────────────────────────

/// A device as seen by the eligibility filter: registry row + live state.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub device_id: Uuid,
    pub status: DeviceStatus,
    pub live: bool,
    /// Already assigned to another open round.
    pub busy: bool,
    pub metrics: DeviceMetrics,
    pub frameworks: Vec<String>,
}

/// The eligibility predicate: live, online, on power, cool, capable, free.
pub fn is_eligible(c: &Candidate, architecture: &str, cfg: &OrchestratorConfig) -> bool {
    c.live
        && c.status == DeviceStatus::Online
        && !c.busy
        && c.metrics.battery_level >= cfg.battery_floor
        && c.metrics.battery_state.allows_training()
        && c.metrics.thermal_state <= cfg.thermal_ceiling
        && c.frameworks.iter().any(|f| f == architecture)
}

/// Select up to `cap` participants from the eligible candidates.
///
/// Oversubscription tie-break: higher battery, then lower thermal, then
/// lower CPU, then device id — so every replica ranks identically.
pub fn select_participants(
    candidates: &[Candidate],
    architecture: &str,
    cap: usize,
    cfg: &OrchestratorConfig,
) -> Vec<Uuid> {
    let mut eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| is_eligible(c, architecture, cfg))
        .collect();
    eligible.sort_by(|a, b| {
        b.metrics
            .battery_level
            .partial_cmp(&a.metrics.battery_level)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.metrics
                    .thermal_state
                    .partial_cmp(&b.metrics.thermal_state)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(
                a.metrics
                    .cpu_usage
                    .partial_cmp(&b.metrics.cpu_usage)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.device_id.cmp(&b.device_id))
    });
    eligible
        .into_iter()
        .take(cap)
        .map(|c| c.device_id)
        .collect()
}

// ── Round evaluation ────────────────────────────────────────────

/// What the open round should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundEval {
    /// Keep waiting for submissions.
    Wait,
    /// Freeze submissions and aggregate.
    Aggregate,
    /// Give up on this attempt.
    Abort { cause: String },
}

/// Decide the next transition for an open round.
///
/// - Everyone still standing has submitted → aggregate if at quorum,
///   otherwise abort now (nobody left to wait for).
/// - Past the deadline with quorum → aggregate.
/// - Past the hard deadline (`deadline + grace`) → aggregate at quorum,
///   abort below it.
pub fn evaluate_round(
    now: Instant,
    deadline: Instant,
    grace: Duration,
    remaining_participants: usize,
    submissions: usize,
    quorum: usize,
) -> RoundEval {
    if submissions >= remaining_participants {
        return if submissions >= quorum {
            RoundEval::Aggregate
        } else {
            RoundEval::Abort {
                cause: format!(
                    "all {} remaining participants submitted but quorum is {}",
                    remaining_participants, quorum
                ),
            }
        };
    }
    if now >= deadline + grace {
        return if submissions >= quorum {
            RoundEval::Aggregate
        } else {
            RoundEval::Abort {
                cause: format!(
                    "hard deadline passed with {}/{} submissions",
                    submissions, quorum
                ),
            }
        };
    }
    if now >= deadline && submissions >= quorum {
        return RoundEval::Aggregate;
    }
    RoundEval::Wait
}

// ── Job runner ──────────────────────────────────────────────────

/// Why a round attempt ended.
enum AttemptOutcome {
    Closed,
    Aborted { cause: String },
    Cancelled,
}

/// Result of the `forming` state.
enum FormResult {
    Selected(Vec<Uuid>),
    Exhausted,
    Cancelled,
}

pub struct JobRunner {
    ctx: Arc<Orchestra>,
    job_id: Uuid,
}

impl JobRunner {
    pub fn new(ctx: Arc<Orchestra>, job_id: Uuid) -> Self {
        JobRunner { ctx, job_id }
    }

    /// Spawn the runner as a background task. Errors inside the state
    /// machine fail the job; they never crash the process.
    pub fn spawn(ctx: Arc<Orchestra>, job_id: Uuid) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            JobRunner::new(ctx, job_id).run().await;
        })
    }

    pub async fn run(self) {
        if let Err(e) = self.drive().await {
            tracing::error!(job_id = %self.job_id, error = %e, "job runner error");
            let reason = e.to_string();
            if let Err(db_err) = self
                .ctx
                .db
                .update_job_status(self.job_id, JobStatus::Failed, Some(&reason))
                .await
            {
                tracing::error!(job_id = %self.job_id, error = %db_err, "failed to mark job failed");
            }
            self.ctx.events.emit(Event::JobFailed {
                job_id: self.job_id,
                reason,
            });
        }
    }

    async fn drive(&self) -> Result<()> {
        let job = self
            .ctx
            .db
            .get_job(self.job_id)
            .await?
            .context("job row vanished")?;
        let quorum = job.quorum.max(1) as usize;
        let round_timeout = Duration::from_secs(job.round_timeout_s.max(1) as u64);
        let mut offline_rx = self.ctx.events.subscribe();

        let first_round = job.current_round as u32 + 1;
        for round in first_round..=job.target_rounds as u32 {
            let mut attempt: u32 = 1;
            loop {
                // ── forming ──
                let participants = match self.form(&job, quorum).await? {
                    FormResult::Selected(p) => p,
                    FormResult::Cancelled => return Ok(()),
                    FormResult::Exhausted => {
                        let reason = format!(
                            "round {}: could not assemble quorum of {} after {} selection attempts",
                            round, quorum, self.ctx.config.selection_max_attempts
                        );
                        self.ctx
                            .db
                            .update_job_status(self.job_id, JobStatus::Failed, Some(&reason))
                            .await?;
                        self.ctx.events.emit(Event::JobFailed {
                            job_id: self.job_id,
                            reason,
                        });
                        return Ok(());
                    }
                };

                // ── open ──
                let global_model_id = self
                    .ctx
                    .db
                    .get_job(self.job_id)
                    .await?
                    .context("job row vanished")?
                    .current_model_id;
                let outcome = self
                    .open_and_collect(
                        &job,
                        round,
                        attempt,
                        &global_model_id,
                        &participants,
                        quorum,
                        round_timeout,
                        &mut offline_rx,
                    )
                    .await?;

                match outcome {
                    AttemptOutcome::Closed => break,
                    AttemptOutcome::Cancelled => return Ok(()),
                    AttemptOutcome::Aborted { cause } => {
                        self.ctx
                            .db
                            .set_round_status(self.job_id, round, RoundStatus::Aborted)
                            .await?;
                        self.ctx.events.emit(Event::RoundAborted {
                            job_id: self.job_id,
                            round,
                            cause: cause.clone(),
                        });
                        self.stop_participants(&participants).await;
                        if attempt > self.ctx.config.round_max_retries {
                            let reason = format!(
                                "round {} aborted {} times, last cause: {}",
                                round, attempt, cause
                            );
                            self.ctx
                                .db
                                .update_job_status(self.job_id, JobStatus::Failed, Some(&reason))
                                .await?;
                            self.ctx.events.emit(Event::JobFailed {
                                job_id: self.job_id,
                                reason,
                            });
                            return Ok(());
                        }
                        attempt += 1;
                    }
                }
            }
        }

        self.ctx
            .db
            .update_job_status(self.job_id, JobStatus::Completed, None)
            .await?;
        self.ctx.events.emit(Event::JobCompleted { job_id: self.job_id });
        self.release_job_pins().await;
        Ok(())
    }

    /// The `forming` state: retry participant selection on a backoff until
    /// quorum is met or attempts run out.
    async fn form(&self, job: &JobRow, quorum: usize) -> Result<FormResult> {
        for attempt in 1..=self.ctx.config.selection_max_attempts {
            if self.job_cancelled().await? {
                return Ok(FormResult::Cancelled);
            }
            let candidates = self.gather_candidates().await?;
            let selected = select_participants(
                &candidates,
                &job.architecture,
                PARTICIPANT_CAP,
                &self.ctx.config,
            );
            if selected.len() >= quorum {
                return Ok(FormResult::Selected(selected));
            }
            tracing::info!(
                job_id = %self.job_id,
                eligible = selected.len(),
                quorum,
                attempt,
                "insufficient eligible devices, backing off"
            );
            tokio::time::sleep(self.ctx.config.selection_backoff()).await;
        }
        Ok(FormResult::Exhausted)
    }

    /// Build the candidate view: registry rows joined with liveness state
    /// and open-round assignments.
    async fn gather_candidates(&self) -> Result<Vec<Candidate>> {
        let rows = self
            .ctx
            .db
            .list_devices(&crate::db::DeviceFilter::default())
            .await?;
        let busy: HashSet<Uuid> = self.ctx.db.busy_devices().await?.into_iter().collect();
        let threshold = self.ctx.config.liveness_threshold();
        let now = Instant::now();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let live_entry = {
                let liveness = self.ctx.liveness.lock().unwrap();
                liveness.get(&row.device_id).cloned()
            };
            // Prefer live metrics over the persisted snapshot; they are
            // at most one heartbeat old.
            let (live, metrics) = match live_entry {
                Some(e) if now.duration_since(e.received_at) <= threshold => (true, e.metrics),
                _ => {
                    let live = self.ctx.is_live(row.device_id).await;
                    let metrics = row
                        .last_metrics
                        .as_ref()
                        .map(|m| m.0.clone())
                        .unwrap_or_default();
                    (live, metrics)
                }
            };
            candidates.push(Candidate {
                device_id: row.device_id,
                status: DeviceStatus::parse(&row.status).unwrap_or(DeviceStatus::Error),
                live,
                busy: busy.contains(&row.device_id),
                metrics,
                frameworks: row.capabilities.0.supported_frameworks.clone(),
            });
        }
        Ok(candidates)
    }

    /// The `open` → `aggregating` → `closed`/`aborted` stretch for one
    /// attempt.
    #[allow(clippy::too_many_arguments)]
    async fn open_and_collect(
        &self,
        job: &JobRow,
        round: u32,
        attempt: u32,
        global_model_id: &str,
        participants: &[Uuid],
        quorum: usize,
        round_timeout: Duration,
        offline_rx: &mut tokio::sync::broadcast::Receiver<Event>,
    ) -> Result<AttemptOutcome> {
        let deadline_instant = Instant::now() + round_timeout;
        let deadline_utc = chrono::Utc::now() + chrono::Duration::from_std(round_timeout)?;
        self.ctx
            .db
            .open_round(
                self.job_id,
                round,
                attempt,
                global_model_id,
                participants,
                deadline_utc,
            )
            .await?;
        self.ctx.store.pin(global_model_id, &self.job_id.to_string());

        for (index, device_id) in participants.iter().enumerate() {
            let command = Command::StartTraining(StartTraining {
                job_id: self.job_id.to_string(),
                model_id: global_model_id.to_string(),
                round,
                partition_index: index as u32,
                partition_total: participants.len() as u32,
                architecture: job.architecture.clone(),
            });
            if let Err(e) = self.ctx.enqueue_command(*device_id, command).await {
                self.ctx.events.emit(Event::Warning {
                    context: "coordinator".into(),
                    message: format!("start_training enqueue for {} failed: {}", device_id, e),
                });
            }
            self.ctx
                .db
                .set_device_status(*device_id, DeviceStatus::Training)
                .await?;
        }
        self.ctx.events.emit(Event::RoundOpened {
            job_id: self.job_id,
            round,
            participants: participants.to_vec(),
        });

        // ── collect until the evaluation says otherwise ──
        let mut failed: HashSet<Uuid> = HashSet::new();
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.job_cancelled().await? {
                self.stop_participants(participants).await;
                return Ok(AttemptOutcome::Cancelled);
            }

            // Straggler handling: a participant that went offline without
            // submitting no longer counts toward "everyone submitted".
            let submitted: HashSet<Uuid> = self
                .ctx
                .db
                .submitted_devices(self.job_id, round)
                .await?
                .into_iter()
                .collect();
            while let Ok(event) = offline_rx.try_recv() {
                if let Event::DeviceOffline { device_id } = event {
                    if participants.contains(&device_id) && !submitted.contains(&device_id) {
                        tracing::warn!(
                            job_id = %self.job_id, round, device_id = %device_id,
                            "participant went offline before submitting"
                        );
                        failed.insert(device_id);
                    }
                }
            }

            let remaining = participants.len() - failed.len();
            match evaluate_round(
                Instant::now(),
                deadline_instant,
                self.ctx.config.round_grace(),
                remaining,
                submitted.len(),
                quorum,
            ) {
                RoundEval::Wait => continue,
                RoundEval::Abort { cause } => return Ok(AttemptOutcome::Aborted { cause }),
                RoundEval::Aggregate => {
                    return self
                        .aggregate_and_close(job, round, global_model_id, participants)
                        .await;
                }
            }
        }
    }

    /// The `aggregating` state: freeze submissions, average, persist.
    async fn aggregate_and_close(
        &self,
        _job: &JobRow,
        round: u32,
        global_model_id: &str,
        participants: &[Uuid],
    ) -> Result<AttemptOutcome> {
        self.ctx
            .db
            .set_round_status(self.job_id, round, RoundStatus::Aggregating)
            .await?;

        // Submissions are frozen here: rows are read once and handed to the
        // aggregator; anything arriving later sees a non-open round.
        let rows = self.ctx.db.get_submissions(self.job_id, round).await?;
        let inputs: Vec<SubmissionInput> = rows
            .into_iter()
            .map(|r| SubmissionInput {
                device_id: r.device_id,
                blob: r.blob,
                num_samples: r.num_samples.max(0) as u64,
                metrics: r.metrics.0,
            })
            .collect();

        let result = aggregator::aggregate_round(
            self.ctx.store.clone(),
            global_model_id.to_string(),
            inputs,
        )
        .await;

        match result {
            Ok(outcome) => {
                for (device_id, reason) in &outcome.rejected {
                    self.ctx.events.emit(Event::SubmissionRejected {
                        job_id: self.job_id,
                        device_id: *device_id,
                        round,
                        reason: reason.clone(),
                    });
                }
                self.ctx
                    .db
                    .close_round(
                        self.job_id,
                        round,
                        &outcome.model_id,
                        outcome.avg_loss,
                        outcome.avg_accuracy,
                        outcome.delta_norm,
                    )
                    .await?;
                self.ctx.store.pin(&outcome.model_id, &self.job_id.to_string());
                *self.ctx.last_aggregate.lock().unwrap() = Some(crate::AggregateSnapshot {
                    job_id: self.job_id,
                    round,
                    avg_loss: outcome.avg_loss,
                    avg_accuracy: outcome.avg_accuracy,
                });
                self.ctx.events.emit(Event::RoundAggregated {
                    job_id: self.job_id,
                    round,
                    model_id: outcome.model_id.clone(),
                    delta_norm: outcome.delta_norm,
                });
                // Submitters are done with this round; wind them down.
                for device_id in &outcome.contributors {
                    if let Err(e) = self
                        .ctx
                        .enqueue_command(
                            *device_id,
                            Command::StopTraining {
                                job_id: self.job_id.to_string(),
                            },
                        )
                        .await
                    {
                        tracing::warn!(device_id = %device_id, error = %e, "stop_training enqueue failed");
                    }
                }
                for device_id in participants {
                    self.ctx.db.release_training_device(*device_id).await.ok();
                }
                Ok(AttemptOutcome::Closed)
            }
            Err(e @ AggregateError::NoUsableSubmissions { .. })
            | Err(e @ AggregateError::ZeroSamples(_)) => Ok(AttemptOutcome::Aborted {
                cause: e.to_string(),
            }),
            Err(other) => {
                // Internal/storage errors also abort the round; the global
                // model id on the job row is untouched, so the retry reuses
                // the previous global model.
                Ok(AttemptOutcome::Aborted {
                    cause: format!("aggregation failed: {}", other),
                })
            }
        }
    }

    async fn stop_participants(&self, participants: &[Uuid]) {
        for device_id in participants {
            if let Err(e) = self
                .ctx
                .enqueue_command(
                    *device_id,
                    Command::StopTraining {
                        job_id: self.job_id.to_string(),
                    },
                )
                .await
            {
                tracing::warn!(device_id = %device_id, error = %e, "stop_training enqueue failed");
            }
            self.ctx.db.release_training_device(*device_id).await.ok();
        }
    }

    async fn job_cancelled(&self) -> Result<bool> {
        let job = self.ctx.db.get_job(self.job_id).await?;
        Ok(match job {
            Some(j) => j.status != JobStatus::Running.as_str(),
            None => true,
        })
    }

    /// Completed jobs stop holding their artifacts; the retention horizon
    /// keeps round history downloadable until GC.
    async fn release_job_pins(&self) {
        let holder = self.job_id.to_string();
        if let Ok(rounds) = self.ctx.db.list_rounds(self.job_id).await {
            for r in rounds {
                self.ctx.store.unpin(&r.global_model_id, &holder);
                if let Some(agg) = &r.aggregate_model_id {
                    self.ctx.store.unpin(agg, &holder);
                }
            }
        }
        if let Ok(Some(job)) = self.ctx.db.get_job(self.job_id).await {
            self.ctx.store.unpin(&job.initial_model_id, &holder);
            self.ctx.store.unpin(&job.current_model_id, &holder);
        }
    }
}
