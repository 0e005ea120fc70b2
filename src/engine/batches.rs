//! Provider batch lifecycle: submit, lock-protected poll, result fan-out.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::context::EngineContext;
use super::outcomes::{self, Resolution};
use super::stages::StageMachine;
use crate::error::{EngineError, StoreError};
use crate::llm::{index_results, BatchItem, BatchItemResult, BatchPoll, ChatRequest, ItemOutcome};
use crate::metrics::TokenUsage;
use crate::models::{BatchStatus, LlmBatch, LlmRequest, Process, RequestKey, RequestStatus, Route};
use crate::policy::RunPolicy;
use crate::ratelimit::{LimitScope, RateLimitKey};

/// What a submit or poll call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    /// Not due, already terminal, or in the wrong state for the call.
    Unchanged(BatchStatus),
    /// Another caller holds the lock.
    Locked,
    /// Rate limit refused; stays queued until the retry-after time.
    Deferred,
    Submitted,
    StillRunning,
    /// Provider error with retries left; back to queued after the backoff.
    Reset,
    Failed,
    Completed,
    Canceled,
}

pub struct BatchEngine {
    ctx: Arc<EngineContext>,
}

impl BatchEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    async fn load(&self, id: Uuid) -> Result<LlmBatch, EngineError> {
        Ok(self
            .ctx
            .store
            .get_batch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))?)
    }

    async fn lock(&self, batch: &LlmBatch, now: DateTime<Utc>) -> Result<Option<LlmBatch>, EngineError> {
        let until = now + self.ctx.batch_lock();
        if !self.ctx.store.try_lock_batch(batch.id, now, until).await? {
            tracing::debug!(batch_id = %batch.id, "Batch lock held, skipping");
            return Ok(None);
        }
        Ok(Some(self.load(batch.id).await?))
    }

    async fn live_requests(&self, batch_id: Uuid) -> Result<Vec<LlmRequest>, EngineError> {
        let requests = self
            .ctx
            .store
            .list_requests_by_route(Route::Batch(batch_id))
            .await?;
        Ok(requests
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect())
    }

    async fn process_for(&self, batch: &mut LlmBatch, now: DateTime<Utc>) -> Result<Process, EngineError> {
        match self.ctx.store.get_process(batch.key.process_id).await? {
            Some(process) => Ok(process),
            None => {
                let reason = "process_not_found";
                batch.status = BatchStatus::Error;
                batch.last_error = Some(reason.to_string());
                batch.next_poll_at = None;
                self.save_unlocked(batch, now).await?;
                let requests = self.live_requests(batch.id).await?;
                outcomes::fail_orphaned(&self.ctx, requests, reason, now).await?;
                Err(EngineError::ProcessNotFound(batch.key.process_id))
            }
        }
    }

    async fn save_unlocked(&self, batch: &mut LlmBatch, now: DateTime<Utc>) -> Result<(), EngineError> {
        batch.locked_until = None;
        batch.updated_at = now;
        self.ctx.store.put_batch(batch).await?;
        Ok(())
    }

    /// Submits a queued batch to the provider.
    pub async fn submit_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<BatchStep, EngineError> {
        let batch = self.load(batch_id).await?;
        if batch.status != BatchStatus::Queued || !batch.is_due(now) {
            return Ok(BatchStep::Unchanged(batch.status));
        }
        let Some(mut batch) = self.lock(&batch, now).await? else {
            return Ok(BatchStep::Locked);
        };
        let process = self.process_for(&mut batch, now).await?;
        let policy = process.policy.clone();

        if process.status.is_terminal() {
            return self.cancel(&mut batch, now).await;
        }

        let mut requests = self.live_requests(batch_id).await?;
        if requests.is_empty() {
            batch.status = BatchStatus::Error;
            batch.last_error = Some("empty_batch".to_string());
            self.save_unlocked(&mut batch, now).await?;
            tracing::warn!(batch_id = %batch_id, "Refusing to submit empty batch");
            return Ok(BatchStep::Failed);
        }
        if requests.len() > policy.max_batch_size {
            self.fail_terminal(&mut batch, requests, "batch_size_exceeded", &policy, now)
                .await?;
            return Ok(BatchStep::Failed);
        }

        let limit_key = RateLimitKey::requests(&batch.model, LimitScope::Batch);
        let reservation = self
            .ctx
            .limiter
            .try_reserve(&limit_key, requests.len() as u64, now)
            .await;
        if !reservation.ok {
            batch.next_poll_at = reservation.retry_after;
            self.save_unlocked(&mut batch, now).await?;
            tracing::debug!(batch_id = %batch_id, retry_after = ?reservation.retry_after, "Batch submit deferred by rate limit");
            return Ok(BatchStep::Deferred);
        }

        let items = requests
            .iter()
            .map(|r| {
                let mut chat = ChatRequest::new(&r.model, &r.user_prompt)
                    .with_max_tokens(policy.max_tokens);
                chat.system = r.system_prompt.clone();
                BatchItem {
                    custom_id: r.key.encode(),
                    request: chat,
                }
            })
            .collect();

        match self.ctx.batch_client.submit(&batch.model, items).await {
            Ok(batch_ref) => {
                batch.status = BatchStatus::Submitted;
                batch.provider_batch_ref = Some(batch_ref);
                batch.last_error = None;
                batch.next_poll_at =
                    Some(now + Duration::milliseconds(policy.poll_interval_ms as i64));
                self.save_unlocked(&mut batch, now).await?;
                for request in requests.iter_mut() {
                    request.status = RequestStatus::Submitted;
                    request.updated_at = now;
                    self.ctx.store.put_request(request).await?;
                }
                tracing::info!(
                    batch_id = %batch_id,
                    key = %batch.key,
                    requests = requests.len(),
                    "Batch submitted"
                );
                Ok(BatchStep::Submitted)
            }
            Err(e) => self.provider_failure(&mut batch, requests, &e.to_string(), &policy, now).await,
        }
    }

    /// Polls an in-flight batch and fans results out when it completes.
    pub async fn poll_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<BatchStep, EngineError> {
        let batch = self.load(batch_id).await?;
        if !batch.status.is_in_flight() || !batch.is_due(now) {
            return Ok(BatchStep::Unchanged(batch.status));
        }
        let Some(mut batch) = self.lock(&batch, now).await? else {
            self.ctx.metrics.record_batch_poll("locked");
            return Ok(BatchStep::Locked);
        };
        let process = self.process_for(&mut batch, now).await?;
        let policy = process.policy.clone();
        let requests = self.live_requests(batch_id).await?;

        let Some(batch_ref) = batch.provider_batch_ref.clone() else {
            return self
                .provider_failure(&mut batch, requests, "missing provider batch reference", &policy, now)
                .await;
        };

        match self.ctx.batch_client.poll(&batch_ref).await {
            Err(e) => {
                // Provider unreachable: keep waiting without spending a retry.
                batch.last_error = Some(e.to_string());
                batch.next_poll_at =
                    Some(now + Duration::milliseconds(policy.poll_interval_ms as i64));
                self.save_unlocked(&mut batch, now).await?;
                self.ctx.metrics.record_batch_poll("unreachable");
                tracing::warn!(batch_id = %batch_id, error = %e, "Batch poll failed");
                Ok(BatchStep::StillRunning)
            }
            Ok(BatchPoll::Running) => {
                batch.status = BatchStatus::Running;
                batch.next_poll_at =
                    Some(now + Duration::milliseconds(policy.poll_interval_ms as i64));
                self.save_unlocked(&mut batch, now).await?;
                self.ctx.metrics.record_batch_poll("running");
                Ok(BatchStep::StillRunning)
            }
            Ok(BatchPoll::Error(reason)) => {
                self.ctx.metrics.record_batch_poll("error");
                self.provider_failure(&mut batch, requests, &reason, &policy, now)
                    .await
            }
            Ok(BatchPoll::Completed(results)) => {
                self.ctx.metrics.record_batch_poll("completed");
                self.complete(&mut batch, requests, results, &policy, now)
                    .await
            }
        }
    }

    /// Whole-batch provider failure: reset for resubmission while retries
    /// remain, otherwise fail every owned request.
    async fn provider_failure(
        &self,
        batch: &mut LlmBatch,
        requests: Vec<LlmRequest>,
        reason: &str,
        policy: &RunPolicy,
        now: DateTime<Utc>,
    ) -> Result<BatchStep, EngineError> {
        batch.attempts += 1;
        if batch.attempts <= policy.max_batch_retries {
            batch.status = BatchStatus::Queued;
            batch.provider_batch_ref = None;
            batch.last_error = Some(reason.to_string());
            batch.next_poll_at =
                Some(now + Duration::milliseconds(policy.retry_backoff_ms as i64));
            self.save_unlocked(batch, now).await?;
            for mut request in requests {
                request.status = RequestStatus::Queued;
                request.updated_at = now;
                self.ctx.store.put_request(&request).await?;
            }
            tracing::warn!(batch_id = %batch.id, attempts = batch.attempts, reason, "Batch failed, resetting for resubmission");
            return Ok(BatchStep::Reset);
        }

        self.fail_terminal(batch, requests, reason, policy, now).await?;
        Ok(BatchStep::Failed)
    }

    async fn fail_terminal(
        &self,
        batch: &mut LlmBatch,
        requests: Vec<LlmRequest>,
        reason: &str,
        policy: &RunPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        batch.status = BatchStatus::Error;
        batch.last_error = Some(reason.to_string());
        batch.next_poll_at = None;
        self.save_unlocked(batch, now).await?;

        let failed = requests.len();
        for mut request in requests {
            outcomes::fail_terminal(&mut request, reason, policy, now);
            self.ctx.store.put_request(&request).await?;
            self.ctx
                .metrics
                .record_request_outcome(&request.model, RequestStatus::Error.as_str());
            outcomes::notify_apply_error(&self.ctx, &request).await;
        }
        tracing::error!(batch_id = %batch.id, key = %batch.key, requests = failed, reason, "Batch failed terminally");

        StageMachine::new(self.ctx.clone())
            .on_request_resolved(batch.key, now)
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        batch: &mut LlmBatch,
        requests: Vec<LlmRequest>,
        results: Vec<BatchItemResult>,
        policy: &RunPolicy,
        now: DateTime<Utc>,
    ) -> Result<BatchStep, EngineError> {
        for result in &results {
            if let Err(e) = RequestKey::decode(&result.custom_id) {
                tracing::error!(batch_id = %batch.id, custom_id = %result.custom_id, error = %e, "Batch result with undecodable key");
            }
        }
        let mut by_key = index_results(results);
        let mut usage = TokenUsage::default();
        let mut retrying = Vec::new();
        let mut first_error = None;

        for mut request in requests {
            let resolution = match by_key.remove(&request.key.encode()) {
                Some(BatchItemResult {
                    outcome:
                        ItemOutcome::Completed {
                            output,
                            input_tokens,
                            output_tokens,
                        },
                    ..
                }) => {
                    let item_usage = TokenUsage::from_counts(input_tokens, output_tokens);
                    usage.add(item_usage);
                    outcomes::apply_success(&self.ctx, &mut request, &output, item_usage, policy, now)
                        .await
                }
                Some(BatchItemResult {
                    outcome: ItemOutcome::Failed { error },
                    ..
                }) => outcomes::apply_failure(&self.ctx, &mut request, &error, policy, now).await,
                None => {
                    outcomes::apply_failure(&self.ctx, &mut request, "missing_result", policy, now)
                        .await
                }
            };

            match resolution {
                Ok(Resolution::Retrying) => retrying.push(request),
                Ok(_) => self.ctx.store.put_request(&request).await?,
                Err(e) => {
                    self.ctx.store.put_request(&request).await?;
                    first_error.get_or_insert(e);
                }
            }
        }

        batch.status = BatchStatus::Success;
        batch.next_poll_at = None;
        self.save_unlocked(batch, now).await?;
        tracing::info!(
            batch_id = %batch.id,
            key = %batch.key,
            retrying = retrying.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Batch completed"
        );

        outcomes::requeue_to_job(&self.ctx, batch.key, retrying, now).await?;
        self.charge_tokens(&batch.model, usage, now).await;

        if let Some(e) = first_error {
            return Err(e);
        }
        StageMachine::new(self.ctx.clone())
            .on_request_resolved(batch.key, now)
            .await?;
        Ok(BatchStep::Completed)
    }

    async fn cancel(&self, batch: &mut LlmBatch, now: DateTime<Utc>) -> Result<BatchStep, EngineError> {
        batch.status = BatchStatus::Canceled;
        batch.next_poll_at = None;
        self.save_unlocked(batch, now).await?;
        for mut request in self.live_requests(batch.id).await? {
            request.status = RequestStatus::Canceled;
            request.updated_at = now;
            self.ctx.store.put_request(&request).await?;
        }
        tracing::info!(batch_id = %batch.id, "Batch canceled with its process");
        Ok(BatchStep::Canceled)
    }

    async fn charge_tokens(&self, model: &str, usage: TokenUsage, now: DateTime<Utc>) {
        if usage.input_tokens > 0 {
            let key = RateLimitKey::input_tokens(model, LimitScope::Batch);
            self.ctx.limiter.charge_post_hoc(&key, usage.input_tokens, now).await;
        }
        if usage.output_tokens > 0 {
            let key = RateLimitKey::output_tokens(model, LimitScope::Batch);
            self.ctx.limiter.charge_post_hoc(&key, usage.output_tokens, now).await;
        }
        self.ctx.metrics.record_tokens(model, usage);
    }
}
