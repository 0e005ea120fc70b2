//! User-facing process lifecycle: create, start, pause, resume, cancel.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::context::EngineContext;
use super::stages::{StageMachine, StageOutcome};
use crate::error::EngineError;
use crate::models::{
    DesiredState, Process, ProcessKind, ProcessPatch, ProcessStatus, RequestStatus, Stage, StopAt,
};
use crate::policy::RunPolicy;

pub struct ProcessLifecycle {
    ctx: Arc<EngineContext>,
}

impl ProcessLifecycle {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    async fn load(&self, id: Uuid) -> Result<Process, EngineError> {
        self.ctx
            .store
            .get_process(id)
            .await?
            .ok_or(EngineError::ProcessNotFound(id))
    }

    /// Registers a process with its policy snapshot. The process starts in
    /// `start` at the first stage of its kind.
    pub async fn create_process(
        &self,
        kind: ProcessKind,
        id: Uuid,
        policy: RunPolicy,
        stop_at_stage: Option<Stage>,
        now: DateTime<Utc>,
    ) -> Result<Process, EngineError> {
        self.ctx.registry.get(kind)?;
        policy.validate()?;

        let mut process = Process::new(id, kind, policy, now);
        if let Some(stop) = stop_at_stage {
            if stop.kind() != kind {
                return Err(EngineError::StageNotInPipeline {
                    kind: kind.to_string(),
                    stage: stop.to_string(),
                });
            }
            process = process.with_stop_at_stage(stop);
        }
        self.ctx.store.insert_process(&process).await?;
        tracing::info!(process_id = %id, kind = %kind, stage = %process.current_stage, "Created process");
        Ok(process)
    }

    /// Hands the process to the scheduler, which launches it on its next tick.
    pub async fn request_start(&self, id: Uuid, now: DateTime<Utc>) -> Result<Process, EngineError> {
        let queued = ProcessPatch::status(ProcessStatus::Queued);
        if !self
            .ctx
            .store
            .update_process(id, &[ProcessStatus::Start], &queued, now)
            .await?
        {
            let process = self.load(id).await?;
            return Err(EngineError::Structural(format!(
                "process {} cannot be queued from status {}",
                id, process.status
            )));
        }
        tracing::info!(process_id = %id, "Queued process for start");
        self.load(id).await
    }

    /// Launches the process: `running`, then issues its current stage.
    pub async fn start(&self, id: Uuid, now: DateTime<Utc>) -> Result<StageOutcome, EngineError> {
        let process = self.load(id).await?;
        if process.desired_state == DesiredState::Canceled {
            return Ok(StageOutcome::Ignored);
        }
        let running = ProcessPatch::status(ProcessStatus::Running);
        if !self
            .ctx
            .store
            .update_process(id, &[ProcessStatus::Start, ProcessStatus::Queued], &running, now)
            .await?
        {
            let process = self.load(id).await?;
            return Err(EngineError::Structural(format!(
                "process {} cannot start from status {}",
                id, process.status
            )));
        }
        tracing::info!(process_id = %id, stage = %process.current_stage, "Started process");

        StageMachine::new(self.ctx.clone())
            .evaluate_stage(id, process.current_stage, now)
            .await
    }

    /// Records user intent.
    ///
    /// - `paused`: pins `stop_at_stage` to the current stage when unset; the
    ///   process pauses once that stage drains.
    /// - `running`: clears `stop_at_stage` and resumes from the current stage.
    /// - `canceled`: cancels immediately, along with requests not yet at the
    ///   provider.
    ///
    /// Every write is conditional on the process still being live, so a
    /// terminal status reached concurrently is never overwritten.
    pub async fn set_desired_state(
        &self,
        id: Uuid,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<Process, EngineError> {
        let store = &self.ctx.store;
        let live = ProcessStatus::ACTIVE;
        let applied = match desired {
            DesiredState::Paused => {
                let pause = ProcessPatch::desired_state(DesiredState::Paused)
                    .with_stop_at(StopAt::PinCurrent);
                store.update_process(id, &live, &pause, now).await?
            }
            DesiredState::Running => {
                let resume = ProcessPatch::status(ProcessStatus::Running)
                    .with_desired_state(DesiredState::Running)
                    .with_stop_at(StopAt::Clear);
                let intent = ProcessPatch::desired_state(DesiredState::Running)
                    .with_stop_at(StopAt::Clear);
                store
                    .update_process(id, &[ProcessStatus::Paused], &resume, now)
                    .await?
                    || store
                        .update_process(
                            id,
                            &[ProcessStatus::Start, ProcessStatus::Queued, ProcessStatus::Running],
                            &intent,
                            now,
                        )
                        .await?
            }
            DesiredState::Canceled => {
                let cancel = ProcessPatch::status(ProcessStatus::Canceled)
                    .with_desired_state(DesiredState::Canceled);
                store.update_process(id, &live, &cancel, now).await?
            }
        };

        let process = self.load(id).await?;
        if !applied {
            tracing::debug!(process_id = %id, status = %process.status, "Ignoring desired state on terminal process");
            return Ok(process);
        }

        match desired {
            DesiredState::Paused => {
                tracing::info!(process_id = %id, stop_at = ?process.stop_at_stage, "Pause requested");
                self.reevaluate(&process, now).await?;
            }
            DesiredState::Running => {
                tracing::info!(process_id = %id, stage = %process.current_stage, "Resume requested");
                self.reevaluate(&process, now).await?;
            }
            DesiredState::Canceled => {
                let canceled = self.cancel_unsent_requests(&process, now).await?;
                self.ctx.metrics.record_stage_transition(process.kind.as_str(), "canceled");
                tracing::info!(process_id = %id, canceled_requests = canceled, "Process canceled");
            }
        }

        self.load(id).await
    }

    async fn reevaluate(&self, process: &Process, now: DateTime<Utc>) -> Result<(), EngineError> {
        if process.status == ProcessStatus::Running {
            StageMachine::new(self.ctx.clone())
                .evaluate_stage(process.id, process.current_stage, now)
                .await?;
        }
        Ok(())
    }

    async fn cancel_unsent_requests(
        &self,
        process: &Process,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let requests = self
            .ctx
            .store
            .list_requests_by_process(process.kind, process.id)
            .await?;
        let mut canceled = 0;
        for mut request in requests {
            if matches!(request.status, RequestStatus::Pending | RequestStatus::Queued) {
                request.status = RequestStatus::Canceled;
                request.updated_at = now;
                self.ctx.store.put_request(&request).await?;
                canceled += 1;
            }
        }
        Ok(canceled)
    }
}
