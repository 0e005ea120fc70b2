//! Applying request results: the retry rule shared by the job and batch
//! engines, and requeueing of failed batch items onto a job.

use chrono::{DateTime, Duration, Utc};

use super::context::EngineContext;
use crate::error::EngineError;
use crate::metrics::TokenUsage;
use crate::models::{LlmJob, LlmRequest, ProcessKey, RequestStatus, Route};
use crate::policy::RunPolicy;

/// How a request ended up after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    /// Back to `pending` with a future `next_attempt_at`.
    Retrying,
    /// Terminal `error`.
    Failed,
}

impl Resolution {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Resolution::Retrying)
    }
}

/// Writes `output` to the owning target and marks the request `success`.
///
/// A structural failure while applying (unparseable output, missing rows)
/// makes the request terminal without consuming retries; a transient one
/// counts as a failed attempt. The caller persists the request.
pub async fn apply_success(
    ctx: &EngineContext,
    request: &mut LlmRequest,
    output: &str,
    usage: TokenUsage,
    policy: &RunPolicy,
    now: DateTime<Utc>,
) -> Result<Resolution, EngineError> {
    let strategy = match ctx.registry.get(request.key.kind) {
        Ok(strategy) => strategy,
        Err(e) => {
            fail_terminal(request, &e.to_string(), policy, now);
            return Err(e);
        }
    };

    request.input_tokens = Some(usage.input_tokens);
    request.output_tokens = Some(usage.output_tokens);

    match strategy
        .apply_result(request.key.target_id, request.key.stage, output)
        .await
    {
        Ok(()) => {
            request.status = RequestStatus::Success;
            request.last_error = None;
            request.next_attempt_at = None;
            request.updated_at = now;
            ctx.metrics
                .record_request_outcome(&request.model, RequestStatus::Success.as_str());
            tracing::debug!(request_id = %request.id, key = %request.key, "Request succeeded");
            Ok(Resolution::Succeeded)
        }
        Err(e) if e.is_structural() => {
            fail_terminal(request, &e.to_string(), policy, now);
            notify_apply_error(ctx, request).await;
            Ok(Resolution::Failed)
        }
        Err(e) => apply_failure(ctx, request, &e.to_string(), policy, now).await,
    }
}

/// Counts one failed attempt and either schedules a retry or fails the
/// request terminally. The caller persists the request.
pub async fn apply_failure(
    ctx: &EngineContext,
    request: &mut LlmRequest,
    error: &str,
    policy: &RunPolicy,
    now: DateTime<Utc>,
) -> Result<Resolution, EngineError> {
    request.attempts += 1;
    request.last_error = Some(error.to_string());
    request.updated_at = now;

    if request.attempts < policy.max_request_attempts {
        request.status = RequestStatus::Pending;
        request.next_attempt_at =
            Some(now + Duration::milliseconds(policy.retry_backoff_ms as i64));
        tracing::info!(
            request_id = %request.id,
            key = %request.key,
            attempts = request.attempts,
            error,
            "Request failed, retrying"
        );
        return Ok(Resolution::Retrying);
    }

    request.status = RequestStatus::Error;
    request.next_attempt_at = None;
    ctx.metrics
        .record_request_outcome(&request.model, RequestStatus::Error.as_str());
    tracing::warn!(
        request_id = %request.id,
        key = %request.key,
        attempts = request.attempts,
        error,
        "Request failed terminally"
    );
    notify_apply_error(ctx, request).await;
    Ok(Resolution::Failed)
}

/// Marks the request terminal `error` with its retries used up.
pub fn fail_terminal(request: &mut LlmRequest, error: &str, policy: &RunPolicy, now: DateTime<Utc>) {
    request.status = RequestStatus::Error;
    request.attempts = request.attempts.max(policy.max_request_attempts);
    request.last_error = Some(error.to_string());
    request.next_attempt_at = None;
    request.updated_at = now;
}

/// Fails the live requests of a job or batch whose process row is gone.
/// Without a process there is no policy snapshot, so the default attempt
/// ceiling is recorded.
pub async fn fail_orphaned(
    ctx: &EngineContext,
    requests: Vec<LlmRequest>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<usize, EngineError> {
    let policy = RunPolicy::default();
    let mut failed = 0;
    for mut request in requests.into_iter().filter(|r| !r.status.is_terminal()) {
        fail_terminal(&mut request, error, &policy, now);
        ctx.store.put_request(&request).await?;
        ctx.metrics
            .record_request_outcome(&request.model, RequestStatus::Error.as_str());
        failed += 1;
    }
    if failed > 0 {
        tracing::warn!(requests = failed, error, "Failed requests of a missing process");
    }
    Ok(failed)
}

/// Runs the pipeline's error hook for a terminally failed request.
///
/// Domain bookkeeping failures are logged; the request itself is already
/// resolved.
pub async fn notify_apply_error(ctx: &EngineContext, request: &LlmRequest) {
    let error = request.last_error.as_deref().unwrap_or("unknown error");
    let result = match ctx.registry.get(request.key.kind) {
        Ok(strategy) => {
            strategy
                .apply_error(request.key.target_id, request.key.stage, error)
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::error!(
            request_id = %request.id,
            key = %request.key,
            error = %e,
            "Failed to record request error on target"
        );
    }
}

/// Moves retrying requests off a batch onto one new job for the same
/// (process, stage). Returns the job id, or `None` when there was nothing to
/// move.
pub async fn requeue_to_job(
    ctx: &EngineContext,
    key: ProcessKey,
    requests: Vec<LlmRequest>,
    now: DateTime<Utc>,
) -> Result<Option<uuid::Uuid>, EngineError> {
    let Some(first) = requests.first() else {
        return Ok(None);
    };
    // Unknown kinds cannot be requeued anywhere.
    ctx.registry.get(key.kind)?;

    let job = LlmJob::new(key, first.model.clone(), first.provider, now);
    ctx.store.insert_job(&job).await?;

    let count = requests.len();
    for mut request in requests {
        request.route = Some(Route::Job(job.id));
        request.status = RequestStatus::Pending;
        request.updated_at = now;
        ctx.store.put_request(&request).await?;
    }

    tracing::info!(job_id = %job.id, key = %key, requests = count, "Requeued failed batch items onto a job");
    Ok(Some(job.id))
}
