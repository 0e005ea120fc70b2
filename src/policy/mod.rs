//! Run policy: the knobs that shape batching, retries and scheduling.
//!
//! A [`RunPolicy`] is resolved once, by folding an ordered list of partial
//! [`PolicyOverride`]s over a base policy, and is then snapshotted on the
//! process it governs. Layers are loaded from YAML as [`PolicyLayers`]:
//!
//! ```yaml
//! global:
//!   poll_interval_ms: 5000
//! team:
//!   research:
//!     max_batch_size: 200
//! provider:
//!   openai:
//!     max_request_attempts: 3
//! model:
//!   gpt-4.1-mini:
//!     min_batch_size: 25
//! ```

mod resolver;

pub use resolver::{resolve_policy, PolicyLayers, PolicyScope};

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::models::Provider;

/// Smallest poll interval a policy may request.
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Models a provider may be routed to under a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderModels {
    pub provider: Provider,
    pub models: Vec<String>,
}

/// Effective, immutable policy for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub poll_interval_ms: u64,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub job_fallback_count: usize,
    pub max_tokens: Option<u32>,
    pub max_batch_retries: u32,
    pub max_request_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_new_batches_per_tick: usize,
    pub max_poll_per_tick: usize,
    pub max_concurrent_batches: Option<usize>,
    pub max_concurrent_requests: Option<usize>,
    pub provider_models: Vec<ProviderModels>,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_batch_size: 500,
            min_batch_size: 10,
            job_fallback_count: 5,
            max_tokens: Some(5000),
            max_batch_retries: 2,
            max_request_attempts: 2,
            retry_backoff_ms: 60_000,
            max_new_batches_per_tick: 4,
            max_poll_per_tick: 10,
            max_concurrent_batches: None,
            max_concurrent_requests: None,
            provider_models: vec![ProviderModels {
                provider: Provider::Openai,
                models: vec![
                    "gpt-4.1".to_string(),
                    "gpt-4.1-mini".to_string(),
                    "gpt-5.2".to_string(),
                    "gpt-5.2-chat".to_string(),
                ],
            }],
        }
    }
}

impl RunPolicy {
    /// Validates value ranges.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(PolicyError::Invalid(format!(
                "poll_interval_ms must be at least {}",
                MIN_POLL_INTERVAL_MS
            )));
        }
        if self.max_batch_size == 0 {
            return Err(PolicyError::Invalid(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(PolicyError::Invalid(
                "min_batch_size cannot exceed max_batch_size".to_string(),
            ));
        }
        if self.max_request_attempts == 0 {
            return Err(PolicyError::Invalid(
                "max_request_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_new_batches_per_tick == 0 || self.max_poll_per_tick == 0 {
            return Err(PolicyError::Invalid(
                "per-tick caps must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_batches == Some(0) || self.max_concurrent_requests == Some(0) {
            return Err(PolicyError::Invalid(
                "concurrency caps must be greater than 0 when set".to_string(),
            ));
        }
        if self.provider_models.is_empty()
            || self.provider_models.iter().any(|p| p.models.is_empty())
        {
            return Err(PolicyError::Invalid(
                "provider_models must list at least one model per provider".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this policy routes `model` through `provider`.
    pub fn allows_model(&self, provider: Provider, model: &str) -> bool {
        self.provider_models
            .iter()
            .any(|spec| spec.provider == provider && spec.models.iter().any(|m| m == model))
    }
}

/// A partial policy; every set field replaces the value below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyOverride {
    pub poll_interval_ms: Option<u64>,
    pub max_batch_size: Option<usize>,
    pub min_batch_size: Option<usize>,
    pub job_fallback_count: Option<usize>,
    pub max_tokens: Option<u32>,
    pub max_batch_retries: Option<u32>,
    pub max_request_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_new_batches_per_tick: Option<usize>,
    pub max_poll_per_tick: Option<usize>,
    pub max_concurrent_batches: Option<usize>,
    pub max_concurrent_requests: Option<usize>,
    pub provider_models: Option<Vec<ProviderModels>>,
}

impl PolicyOverride {
    /// Applies this override on top of `base`.
    ///
    /// Fields merge shallowly; `provider_models` is replaced as a whole.
    pub fn apply(&self, base: RunPolicy) -> RunPolicy {
        RunPolicy {
            poll_interval_ms: self.poll_interval_ms.unwrap_or(base.poll_interval_ms),
            max_batch_size: self.max_batch_size.unwrap_or(base.max_batch_size),
            min_batch_size: self.min_batch_size.unwrap_or(base.min_batch_size),
            job_fallback_count: self.job_fallback_count.unwrap_or(base.job_fallback_count),
            max_tokens: self.max_tokens.or(base.max_tokens),
            max_batch_retries: self.max_batch_retries.unwrap_or(base.max_batch_retries),
            max_request_attempts: self
                .max_request_attempts
                .unwrap_or(base.max_request_attempts),
            retry_backoff_ms: self.retry_backoff_ms.unwrap_or(base.retry_backoff_ms),
            max_new_batches_per_tick: self
                .max_new_batches_per_tick
                .unwrap_or(base.max_new_batches_per_tick),
            max_poll_per_tick: self.max_poll_per_tick.unwrap_or(base.max_poll_per_tick),
            max_concurrent_batches: self.max_concurrent_batches.or(base.max_concurrent_batches),
            max_concurrent_requests: self
                .max_concurrent_requests
                .or(base.max_concurrent_requests),
            provider_models: self
                .provider_models
                .clone()
                .unwrap_or(base.provider_models),
        }
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    pub fn with_min_batch_size(mut self, size: usize) -> Self {
        self.min_batch_size = Some(size);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn with_job_fallback_count(mut self, count: usize) -> Self {
        self.job_fallback_count = Some(count);
        self
    }

    pub fn with_max_request_attempts(mut self, attempts: u32) -> Self {
        self.max_request_attempts = Some(attempts);
        self
    }

    pub fn with_max_batch_retries(mut self, retries: u32) -> Self {
        self.max_batch_retries = Some(retries);
        self
    }

    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = Some(ms);
        self
    }

    pub fn with_provider_models(mut self, models: Vec<ProviderModels>) -> Self {
        self.provider_models = Some(models);
        self
    }
}
