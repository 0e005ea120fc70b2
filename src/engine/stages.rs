//! Stage advancement for process instances.
//!
//! After every resolution the owning stage is recounted. A stage that has
//! drained either fails the process (no target produced output), completes it
//! (last stage), pauses it (stop stage reached) or advances it and enqueues
//! the next stage.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::context::EngineContext;
use super::orchestrator::Orchestrator;
use crate::error::EngineError;
use crate::models::{
    DesiredState, Process, ProcessKey, ProcessPatch, ProcessStatus, RequestKey, Stage,
};

/// Target counts for one (process, stage).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    /// Output already written.
    pub completed: usize,
    /// Upstream input missing, or retries exhausted.
    pub failed: usize,
    /// A live request exists or retries remain.
    pub pending: usize,
    /// Pending targets without any live request.
    pub unissued: usize,
}

impl StageCounts {
    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }
}

/// What [`StageMachine::evaluate_stage`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Process is terminal, not running, or already past this stage.
    Ignored,
    /// Work is still outstanding.
    Waiting,
    Advanced { to: Stage },
    Paused,
    Completed,
    Failed,
}

pub struct StageMachine {
    ctx: Arc<EngineContext>,
}

impl StageMachine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Entry point for the engines after a request reached a terminal state.
    pub async fn on_request_resolved(
        &self,
        key: ProcessKey,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, EngineError> {
        self.evaluate_stage(key.process_id, key.stage, now).await
    }

    pub async fn count_stage(
        &self,
        process: &Process,
        stage: Stage,
    ) -> Result<StageCounts, EngineError> {
        let strategy = self.ctx.registry.get(process.kind)?;
        let targets = strategy.list_targets(process.id, stage).await?;

        let mut counts = StageCounts::default();
        for target in targets {
            if target.output_present {
                counts.completed += 1;
                continue;
            }
            if target.input.is_none() {
                counts.failed += 1;
                continue;
            }
            let key = RequestKey::new(process.kind, process.id, target.target_id, stage);
            let requests = self.ctx.store.list_requests_by_key(&key).await?;
            if requests.iter().any(|r| !r.status.is_terminal()) {
                counts.pending += 1;
                continue;
            }
            let attempts = requests.iter().map(|r| r.attempts).max().unwrap_or(0);
            if attempts >= process.policy.max_request_attempts {
                counts.failed += 1;
            } else {
                counts.pending += 1;
                counts.unissued += 1;
            }
        }
        Ok(counts)
    }

    /// Recomputes `stage` for the process and moves it forward when drained.
    ///
    /// Stages that drain immediately after advancing (no targets, everything
    /// blocked) are walked through in the same call.
    pub async fn evaluate_stage(
        &self,
        process_id: Uuid,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, EngineError> {
        let mut stage = stage;
        let mut outcome = StageOutcome::Ignored;

        loop {
            let process = self
                .ctx
                .store
                .get_process(process_id)
                .await?
                .ok_or(EngineError::ProcessNotFound(process_id))?;

            if process.status != ProcessStatus::Running || process.current_stage != stage {
                return Ok(outcome);
            }

            let counts = self.count_stage(&process, stage).await?;
            tracing::debug!(
                process_id = %process_id,
                stage = %stage,
                completed = counts.completed,
                failed = counts.failed,
                pending = counts.pending,
                "Evaluated stage"
            );

            if !counts.is_drained() {
                if counts.unissued > 0 {
                    Orchestrator::new(self.ctx.clone())
                        .enqueue_stage(process_id, stage, now)
                        .await?;
                }
                return Ok(StageOutcome::Waiting);
            }

            let kind = process.kind.as_str();
            let terminal = if counts.completed == 0 && counts.failed > 0 {
                let error = format!(
                    "stage {} produced no output ({} targets failed)",
                    stage, counts.failed
                );
                Some((
                    ProcessPatch::status(ProcessStatus::Error).with_last_error(error),
                    StageOutcome::Failed,
                ))
            } else if process.kind.is_last_stage(stage) {
                Some((ProcessPatch::status(ProcessStatus::Completed), StageOutcome::Completed))
            } else if process.stop_at_stage == Some(stage) {
                Some((
                    ProcessPatch::status(ProcessStatus::Paused)
                        .with_desired_state(DesiredState::Paused),
                    StageOutcome::Paused,
                ))
            } else {
                None
            };

            // Terminal writes only land while the process is still running; a
            // concurrent cancel wins.
            if let Some((patch, transition)) = terminal {
                if !self
                    .ctx
                    .store
                    .update_process(process_id, &[ProcessStatus::Running], &patch, now)
                    .await?
                {
                    tracing::debug!(process_id = %process_id, stage = %stage, "Process left running during evaluation");
                    return Ok(StageOutcome::Ignored);
                }
                match transition {
                    StageOutcome::Failed => {
                        self.ctx.metrics.record_stage_transition(kind, "error");
                        tracing::warn!(process_id = %process_id, stage = %stage, failed = counts.failed, "Process failed");
                    }
                    StageOutcome::Completed => {
                        self.ctx.metrics.record_stage_transition(kind, "completed");
                        tracing::info!(process_id = %process_id, stage = %stage, completed = counts.completed, "Process completed");
                    }
                    _ => {
                        self.ctx.metrics.record_stage_transition(kind, "paused");
                        tracing::info!(process_id = %process_id, stage = %stage, "Process paused at stage boundary");
                    }
                }
                return Ok(transition);
            }

            let Some(next) = process.kind.next_stage(stage) else {
                return Ok(outcome);
            };
            if !self
                .ctx
                .store
                .advance_stage(process_id, stage, next, now)
                .await?
            {
                tracing::debug!(process_id = %process_id, stage = %stage, "Stage already advanced elsewhere");
                return Ok(outcome);
            }
            self.ctx.metrics.record_stage_transition(kind, "advanced");
            tracing::info!(process_id = %process_id, from = %stage, to = %next, "Advanced stage");
            outcome = StageOutcome::Advanced { to: next };

            let enqueued = Orchestrator::new(self.ctx.clone())
                .enqueue_stage(process_id, next, now)
                .await?;
            if !enqueued.is_empty() {
                return Ok(outcome);
            }
            stage = next;
        }
    }
}
