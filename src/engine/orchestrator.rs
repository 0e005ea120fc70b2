//! Target discovery and request creation for one (process, stage).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::context::EngineContext;
use super::router::{decide, RouteDecision};
use crate::error::EngineError;
use crate::models::{
    model_spec, LlmBatch, LlmJob, LlmRequest, Process, ProcessKey, RequestKey, RequestStatus,
    Route, Stage,
};
use crate::pipeline::StageTarget;

/// Requests created by one [`Orchestrator::enqueue_stage`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOutcome {
    pub request_ids: Vec<Uuid>,
    /// One job or batch per chunk of at most `max_batch_size` requests.
    pub routes: Vec<Route>,
}

impl EnqueueOutcome {
    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty()
    }
}

/// A target that still needs a request, with the attempts already spent on it.
struct PendingTarget {
    target_id: Uuid,
    input: String,
    prior_attempts: u32,
}

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Creates requests for every pending target of `stage` and routes them
    /// to new jobs or batches. Non-batchable models get a single job.
    ///
    /// Calling it again before any result arrives creates nothing.
    pub async fn enqueue_stage(
        &self,
        process_id: Uuid,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, EngineError> {
        let process = self
            .ctx
            .store
            .get_process(process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_id))?;

        if stage.kind() != process.kind {
            return Err(EngineError::StageNotInPipeline {
                kind: process.kind.to_string(),
                stage: stage.to_string(),
            });
        }
        if process.status.is_terminal() || process.is_past_stop(stage) {
            tracing::debug!(process_id = %process_id, stage = %stage, status = %process.status, "Skipping enqueue");
            return Ok(EnqueueOutcome::default());
        }

        let strategy = self.ctx.registry.get(process.kind)?;
        let targets = strategy.list_targets(process_id, stage).await?;
        let pending = self.pending_targets(&process, stage, targets).await?;
        if pending.is_empty() {
            return Ok(EnqueueOutcome::default());
        }

        let model = strategy.model_for_stage(process_id, stage).await?;
        let spec = model_spec(&model)?;
        let policy = &process.policy;

        let process_key = ProcessKey::new(process.kind, process_id, stage);

        // Batches never exceed `max_batch_size`; a short tail is routed on
        // its own size and may fall back to a job.
        let chunk_size = if spec.batchable {
            policy.max_batch_size.max(1)
        } else {
            pending.len()
        };
        let mut outcome = EnqueueOutcome::default();
        for chunk in pending.chunks(chunk_size) {
            let decision = decide(spec.batchable, chunk.len(), policy);
            let (route, request_status) = match decision {
                RouteDecision::Job => {
                    let job = LlmJob::new(process_key, &model, spec.provider, now);
                    self.ctx.store.insert_job(&job).await?;
                    (Route::Job(job.id), RequestStatus::Pending)
                }
                RouteDecision::Batch => {
                    let batch = LlmBatch::new(process_key, &model, spec.provider, now);
                    self.ctx.store.insert_batch(&batch).await?;
                    (Route::Batch(batch.id), RequestStatus::Queued)
                }
            };

            for target in chunk {
                let key = RequestKey::new(process.kind, process_id, target.target_id, stage);
                let prompt = strategy.build_prompt(stage, &target.input);
                let mut request = LlmRequest::new(key, &model, spec.provider, prompt.user, now);
                request.system_prompt = prompt.system;
                request.attempts = target.prior_attempts;
                request.status = request_status;
                request.route = Some(route);
                self.ctx.store.insert_request(&request).await?;
                outcome.request_ids.push(request.id);
            }

            tracing::info!(
                process_id = %process_id,
                stage = %stage,
                model = %model,
                route = ?decision,
                requests = chunk.len(),
                "Enqueued stage requests"
            );
            outcome.routes.push(route);
        }

        Ok(outcome)
    }

    /// Targets with no output, available input, no live request and retries
    /// left.
    async fn pending_targets(
        &self,
        process: &Process,
        stage: Stage,
        targets: Vec<StageTarget>,
    ) -> Result<Vec<PendingTarget>, EngineError> {
        let mut pending = Vec::new();
        for target in targets {
            if target.output_present {
                continue;
            }
            let Some(input) = target.input else {
                continue;
            };
            let key = RequestKey::new(process.kind, process.id, target.target_id, stage);
            let existing = self.ctx.store.list_requests_by_key(&key).await?;
            if existing.iter().any(|r| !r.status.is_terminal()) {
                continue;
            }
            let prior_attempts = existing.iter().map(|r| r.attempts).max().unwrap_or(0);
            if prior_attempts >= process.policy.max_request_attempts {
                continue;
            }
            pending.push(PendingTarget {
                target_id: target.target_id,
                input,
                prior_attempts,
            });
        }
        Ok(pending)
    }
}
