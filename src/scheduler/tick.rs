//! The global scheduler tick.
//!
//! A tick runs only while it holds the single scheduler lock; a tick that
//! finds the lock held returns immediately. Every step catches and logs
//! failures of individual processes, batches and jobs so one bad entity does
//! not stall the rest.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::candidates::{due_polls, one_per_model, skip_reason, Candidate, SchedulingPolicy};
use crate::engine::{BatchEngine, BatchStep, EngineContext, JobEngine, ProcessLifecycle};
use crate::error::EngineError;
use crate::models::{BatchStatus, JobStatus, Process, ProcessStatus, SchedulerState};

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// False when another tick held the lock.
    pub ran: bool,
    /// Queued processes launched.
    pub launched: usize,
    /// Batches polled.
    pub polled: usize,
    /// Running jobs continued.
    pub jobs_run: usize,
    /// Queued batches submitted to the provider.
    pub submitted: usize,
    /// Queued jobs started.
    pub started: usize,
    /// Queued work held back by a process filter.
    pub skipped: usize,
    /// Entities whose step failed.
    pub errors: usize,
    pub next_tick_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    ctx: Arc<EngineContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn min_delay(&self) -> Duration {
        Duration::milliseconds(self.ctx.config.scheduler_min_delay_ms as i64)
    }

    /// Makes sure a tick is scheduled: a no-op when one is already due in the
    /// future, otherwise schedules one after the minimum delay.
    pub async fn ensure_scheduler(&self, now: DateTime<Utc>) -> Result<SchedulerState, EngineError> {
        let mut state = self.ctx.store.get_scheduler_state().await?;
        if state.next_tick_at.is_some_and(|at| at > now) {
            return Ok(state);
        }
        state.next_tick_at = Some(now + self.min_delay());
        state.updated_at = Some(now);
        self.ctx.store.put_scheduler_state(&state).await?;
        debug!(next_tick_at = ?state.next_tick_at, "Scheduled scheduler tick");
        Ok(state)
    }

    /// Runs one tick at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let started = Instant::now();
        let lock_until =
            now + Duration::milliseconds(self.ctx.config.scheduler_lock_ms as i64);
        if !self.ctx.store.try_lock_scheduler(now, lock_until).await? {
            debug!("Scheduler lock held, skipping tick");
            self.ctx
                .metrics
                .record_tick(false, started.elapsed().as_secs_f64());
            return Ok(TickReport::default());
        }

        let mut report = TickReport {
            ran: true,
            ..TickReport::default()
        };
        let steps = self.run_steps(now, &mut report).await;
        let policy = steps.as_ref().copied().unwrap_or_default();

        let next_tick_at = now + policy.next_tick_delay(self.ctx.config.scheduler_min_delay_ms);
        self.ctx
            .store
            .put_scheduler_state(&SchedulerState {
                locked_until: None,
                next_tick_at: Some(next_tick_at),
                updated_at: Some(now),
            })
            .await?;
        report.next_tick_at = Some(next_tick_at);
        self.ctx
            .metrics
            .record_tick(true, started.elapsed().as_secs_f64());
        steps?;

        info!(
            launched = report.launched,
            polled = report.polled,
            jobs_run = report.jobs_run,
            submitted = report.submitted,
            started = report.started,
            skipped = report.skipped,
            errors = report.errors,
            next_tick_at = %next_tick_at,
            "Scheduler tick finished"
        );
        Ok(report)
    }

    async fn run_steps(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<SchedulingPolicy, EngineError> {
        self.launch_queued(now, report).await?;

        let active = self.active_processes().await?;
        self.ctx.metrics.set_active_processes(active.len());
        let policy = SchedulingPolicy::union(active.iter().map(|p| &p.policy));

        self.poll_batches(&policy, &active, now, report).await?;
        self.continue_jobs(now, report).await?;
        self.launch_new_work(&policy, now, report).await?;
        Ok(policy)
    }

    async fn active_processes(&self) -> Result<Vec<Process>, EngineError> {
        let mut active = Vec::new();
        for status in ProcessStatus::ACTIVE {
            active.extend(self.ctx.store.list_processes_by_status(status).await?);
        }
        Ok(active)
    }

    /// Step 0: start processes handed over by `request_start`.
    async fn launch_queued(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), EngineError> {
        let queued = self
            .ctx
            .store
            .list_processes_by_status(ProcessStatus::Queued)
            .await?;
        let lifecycle = ProcessLifecycle::new(self.ctx.clone());
        for process in queued {
            match lifecycle.start(process.id, now).await {
                Ok(outcome) => {
                    report.launched += 1;
                    debug!(process_id = %process.id, outcome = ?outcome, "Launched queued process");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(process_id = %process.id, error = %e, "Failed to launch process");
                }
            }
        }
        Ok(())
    }

    /// Step 2a: poll due in-flight batches.
    async fn poll_batches(
        &self,
        policy: &SchedulingPolicy,
        active: &[Process],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        let mut in_flight = self
            .ctx
            .store
            .list_batches_by_status(BatchStatus::Submitted)
            .await?;
        in_flight.extend(
            self.ctx
                .store
                .list_batches_by_status(BatchStatus::Running)
                .await?,
        );

        let caps: HashMap<Uuid, usize> = active
            .iter()
            .map(|p| (p.id, p.policy.max_poll_per_tick))
            .collect();
        let engine = BatchEngine::new(self.ctx.clone());
        for batch in due_polls(in_flight, &caps, policy.max_poll_per_tick, now) {
            match engine.poll_batch(batch.id, now).await {
                Ok(step) => {
                    report.polled += 1;
                    debug!(batch_id = %batch.id, step = ?step, "Polled batch");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(batch_id = %batch.id, error = %e, "Batch poll failed");
                }
            }
        }
        Ok(())
    }

    /// Step 2b: continue running jobs whose next round is due.
    async fn continue_jobs(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), EngineError> {
        let running = self
            .ctx
            .store
            .list_jobs_by_status(JobStatus::Running)
            .await?;
        let engine = JobEngine::new(self.ctx.clone());
        for job in running.into_iter().filter(|j| j.is_due(now)) {
            match engine.run_job(job.id, now).await {
                Ok(_) => report.jobs_run += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %job.id, error = %e, "Job round failed");
                }
            }
        }
        Ok(())
    }

    /// Step 3: submit queued batches and start queued jobs.
    async fn launch_new_work(
        &self,
        policy: &SchedulingPolicy,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        let mut candidates: Vec<Candidate> = self
            .ctx
            .store
            .list_batches_by_status(BatchStatus::Queued)
            .await?
            .into_iter()
            .filter(|b| b.is_due(now) && !b.is_locked(now))
            .map(Candidate::Batch)
            .collect();
        candidates.extend(
            self.ctx
                .store
                .list_jobs_by_status(JobStatus::Queued)
                .await?
                .into_iter()
                .filter(|j| j.is_due(now))
                .map(Candidate::Job),
        );

        let mut processes: HashMap<Uuid, Option<Process>> = HashMap::new();
        let mut in_flight: HashMap<Uuid, usize> = HashMap::new();
        let mut eligible = Vec::new();
        for candidate in candidates {
            let key = candidate.key();
            if !processes.contains_key(&key.process_id) {
                let process = self.ctx.store.get_process(key.process_id).await?;
                processes.insert(key.process_id, process);
            }
            // Missing processes are left to the engines, which fail the work.
            let Some(Some(process)) = processes.get(&key.process_id) else {
                eligible.push(candidate);
                continue;
            };

            let batches_in_flight = if candidate.is_batch() {
                Some(match in_flight.get(&process.id) {
                    Some(count) => *count,
                    None => {
                        let count = self.count_in_flight(process).await?;
                        in_flight.insert(process.id, count);
                        count
                    }
                })
            } else {
                None
            };

            match skip_reason(process, &key, candidate.provider(), candidate.model(), batches_in_flight) {
                Some(reason) => {
                    report.skipped += 1;
                    debug!(
                        id = %candidate.id(),
                        key = %key,
                        reason = reason.as_str(),
                        "Holding back queued work"
                    );
                }
                None => eligible.push(candidate),
            }
        }

        let batch_engine = BatchEngine::new(self.ctx.clone());
        let job_engine = JobEngine::new(self.ctx.clone());
        for candidate in one_per_model(eligible, policy.max_new_batches_per_tick) {
            let key = candidate.key();
            match candidate {
                Candidate::Batch(batch) => {
                    if let Some(count) = in_flight.get(&key.process_id).copied() {
                        let cap = processes
                            .get(&key.process_id)
                            .and_then(|p| p.as_ref())
                            .and_then(|p| p.policy.max_concurrent_batches);
                        if cap.is_some_and(|cap| count >= cap) {
                            report.skipped += 1;
                            continue;
                        }
                    }
                    match batch_engine.submit_batch(batch.id, now).await {
                        Ok(BatchStep::Submitted) => {
                            report.submitted += 1;
                            *in_flight.entry(key.process_id).or_insert(0) += 1;
                        }
                        Ok(step) => debug!(batch_id = %batch.id, step = ?step, "Batch not submitted"),
                        Err(e) => {
                            report.errors += 1;
                            error!(batch_id = %batch.id, error = %e, "Batch submit failed");
                        }
                    }
                }
                Candidate::Job(job) => match job_engine.run_job(job.id, now).await {
                    Ok(_) => report.started += 1,
                    Err(e) => {
                        report.errors += 1;
                        error!(job_id = %job.id, error = %e, "Job start failed");
                    }
                },
            }
        }
        Ok(())
    }

    async fn count_in_flight(&self, process: &Process) -> Result<usize, EngineError> {
        let batches = self
            .ctx
            .store
            .list_batches_by_process(process.kind, process.id)
            .await?;
        Ok(batches.iter().filter(|b| b.status.is_in_flight()).count())
    }
}
