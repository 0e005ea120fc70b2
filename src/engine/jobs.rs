//! Synchronous job execution.
//!
//! A job runs its due requests one call at a time. While any request is still
//! pending the job stays `running` and re-arms `next_run_at`; once nothing is
//! pending it finalizes to `success` or `error` and is never retried.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::context::EngineContext;
use super::outcomes::{self, Resolution};
use super::stages::StageMachine;
use crate::error::{EngineError, StoreError};
use crate::llm::ChatRequest;
use crate::metrics::TokenUsage;
use crate::models::{JobStatus, LlmJob, LlmRequest, RequestStatus, Route};
use crate::policy::RunPolicy;
use crate::ratelimit::{LimitScope, RateLimitKey};

/// Result of one job round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub has_pending: bool,
}

pub struct JobEngine {
    ctx: Arc<EngineContext>,
}

impl JobEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Runs one round of a job at `now`.
    pub async fn run_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<JobReport, EngineError> {
        let mut job = self
            .ctx
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        let mut report = JobReport::default();
        if job.status.is_terminal() {
            return Ok(report);
        }

        let Some(process) = self.ctx.store.get_process(job.key.process_id).await? else {
            let reason = format!("process {} not found", job.key.process_id);
            self.fail_job(&mut job, &reason, now).await?;
            let requests = self
                .ctx
                .store
                .list_requests_by_route(Route::Job(job_id))
                .await?;
            outcomes::fail_orphaned(&self.ctx, requests, &reason, now).await?;
            return Err(EngineError::ProcessNotFound(job.key.process_id));
        };
        let requests = self
            .ctx
            .store
            .list_requests_by_route(Route::Job(job_id))
            .await?;

        if process.status.is_terminal() {
            for mut request in requests {
                if !request.status.is_terminal() && request.status != RequestStatus::Submitted {
                    request.status = RequestStatus::Canceled;
                    request.updated_at = now;
                    self.ctx.store.put_request(&request).await?;
                }
            }
            job.status = JobStatus::Error;
            job.last_error = Some(format!("process {}", process.status));
            job.next_run_at = None;
            job.updated_at = now;
            self.ctx.store.put_job(&job).await?;
            return Ok(report);
        }

        let policy = process.policy.clone();
        job.status = JobStatus::Running;
        job.updated_at = now;
        self.ctx.store.put_job(&job).await?;

        let mut has_errors = false;
        let mut next_due: Option<DateTime<Utc>> = None;
        let mut resolved = false;
        let call_budget = policy.max_concurrent_requests.unwrap_or(usize::MAX);

        for mut request in requests {
            match request.status {
                RequestStatus::Success => continue,
                RequestStatus::Error | RequestStatus::Canceled => {
                    has_errors = true;
                    continue;
                }
                _ => {}
            }

            if !request.is_due(now) || report.attempted >= call_budget {
                report.has_pending = true;
                next_due = earliest(next_due, request.next_attempt_at);
                continue;
            }

            let limit_key = RateLimitKey::requests(&request.model, LimitScope::Job);
            let reservation = self.ctx.limiter.try_reserve(&limit_key, 1, now).await;
            if !reservation.ok {
                request.next_attempt_at = reservation.retry_after;
                request.updated_at = now;
                self.ctx.store.put_request(&request).await?;
                report.rate_limited += 1;
                report.has_pending = true;
                next_due = earliest(next_due, reservation.retry_after);
                tracing::debug!(request_id = %request.id, model = %request.model, "Rate limited, deferring request");
                continue;
            }

            report.attempted += 1;
            let resolution = self.execute(&mut request, &policy, now).await;
            self.ctx.store.put_request(&request).await?;
            match resolution? {
                Resolution::Succeeded => {
                    report.succeeded += 1;
                    resolved = true;
                }
                Resolution::Retrying => {
                    report.retrying += 1;
                    report.has_pending = true;
                    next_due = earliest(next_due, request.next_attempt_at);
                }
                Resolution::Failed => {
                    report.failed += 1;
                    has_errors = true;
                    resolved = true;
                }
            }
        }

        if report.has_pending {
            job.next_run_at = Some(next_due.unwrap_or_else(|| {
                now + Duration::milliseconds(policy.retry_backoff_ms as i64)
            }));
        } else {
            job.status = if has_errors {
                JobStatus::Error
            } else {
                JobStatus::Success
            };
            job.next_run_at = None;
            tracing::info!(job_id = %job.id, key = %job.key, status = %job.status, "Job finalized");
        }
        job.updated_at = now;
        self.ctx.store.put_job(&job).await?;

        if resolved {
            StageMachine::new(self.ctx.clone())
                .on_request_resolved(job.key, now)
                .await?;
        }
        Ok(report)
    }

    /// One chat call plus result application.
    async fn execute(
        &self,
        request: &mut LlmRequest,
        policy: &RunPolicy,
        now: DateTime<Utc>,
    ) -> Result<Resolution, EngineError> {
        let mut chat = ChatRequest::new(&request.model, &request.user_prompt)
            .with_max_tokens(policy.max_tokens);
        chat.system = request.system_prompt.clone();

        match self.ctx.chat.chat(chat).await {
            Ok(response) => {
                let usage = TokenUsage::from_counts(response.input_tokens, response.output_tokens);
                self.charge_tokens(&request.model, usage, now).await;
                outcomes::apply_success(&self.ctx, request, &response.text, usage, policy, now)
                    .await
            }
            Err(e) => outcomes::apply_failure(&self.ctx, request, &e.to_string(), policy, now).await,
        }
    }

    async fn charge_tokens(&self, model: &str, usage: TokenUsage, now: DateTime<Utc>) {
        if usage.input_tokens > 0 {
            let key = RateLimitKey::input_tokens(model, LimitScope::Job);
            self.ctx.limiter.charge_post_hoc(&key, usage.input_tokens, now).await;
        }
        if usage.output_tokens > 0 {
            let key = RateLimitKey::output_tokens(model, LimitScope::Job);
            self.ctx.limiter.charge_post_hoc(&key, usage.output_tokens, now).await;
        }
        self.ctx.metrics.record_tokens(model, usage);
    }

    async fn fail_job(&self, job: &mut LlmJob, reason: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        job.status = JobStatus::Error;
        job.last_error = Some(reason.to_string());
        job.next_run_at = None;
        job.updated_at = now;
        self.ctx.store.put_job(job).await?;
        tracing::error!(job_id = %job.id, reason, "Job failed");
        Ok(())
    }
}

fn earliest(current: Option<DateTime<Utc>>, candidate: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
