//! In-process token buckets.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::{LimitMetric, LimitScope, RateLimitKey, RateLimiter, Reservation};
use crate::error::PolicyError;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Per-minute allowances for one scope. Unset metrics are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketLimits {
    pub requests_per_minute: Option<u64>,
    pub input_tokens_per_minute: Option<u64>,
    pub output_tokens_per_minute: Option<u64>,
}

impl BucketLimits {
    fn for_metric(&self, metric: LimitMetric) -> Option<u64> {
        match metric {
            LimitMetric::Requests => self.requests_per_minute,
            LimitMetric::InputTokens => self.input_tokens_per_minute,
            LimitMetric::OutputTokens => self.output_tokens_per_minute,
        }
    }

    fn has_zero(&self) -> bool {
        [
            self.requests_per_minute,
            self.input_tokens_per_minute,
            self.output_tokens_per_minute,
        ]
        .contains(&Some(0))
    }
}

/// Limits for one model, split by traffic class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeLimits {
    pub job: BucketLimits,
    pub batch: BucketLimits,
}

/// Rate limits keyed by model id.
///
/// ```yaml
/// gpt-4.1:
///   job:
///     requests_per_minute: 500
///   batch:
///     requests_per_minute: 50000
///     output_tokens_per_minute: 2000000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimits {
    pub models: HashMap<String, ScopeLimits>,
}

impl RateLimits {
    /// Parses and validates limits. A zero allowance is rejected; leave the
    /// metric unset for no limit.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let limits: Self = serde_yaml::from_str(yaml)?;
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for (model, limits) in &self.models {
            if limits.job.has_zero() || limits.batch.has_zero() {
                return Err(PolicyError::Invalid(format!(
                    "rate limits for {} must be greater than 0",
                    model
                )));
            }
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn with_model(mut self, model: impl Into<String>, limits: ScopeLimits) -> Self {
        self.models.insert(model.into(), limits);
        self
    }

    /// Capacity per minute for `key`, or `None` if unlimited.
    fn capacity(&self, key: &RateLimitKey) -> Option<u64> {
        let limits = self.models.get(&key.model)?;
        match key.scope {
            LimitScope::Job => limits.job.for_metric(key.metric),
            LimitScope::Batch => limits.batch.for_metric(key.metric),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    updated_at: DateTime<Utc>,
}

impl Bucket {
    fn full(capacity: u64, now: DateTime<Utc>) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            updated_at: now,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.updated_at).num_milliseconds();
        if elapsed > 0 {
            self.tokens =
                (self.tokens + elapsed as f64 * self.capacity / MS_PER_MINUTE).min(self.capacity);
            self.updated_at = now;
        }
    }

    /// Milliseconds until `count` fits, or `None` if it fits now.
    ///
    /// A request larger than the whole bucket is admitted once the bucket
    /// is full, otherwise it could never run. A zero-capacity bucket admits
    /// nothing and is rechecked after a minute.
    fn wait_ms(&self, count: u64) -> Option<i64> {
        if self.capacity <= 0.0 {
            return Some(MS_PER_MINUTE as i64);
        }
        let needed = (count as f64).min(self.capacity);
        if self.tokens >= needed {
            return None;
        }
        Some(((needed - self.tokens) * MS_PER_MINUTE / self.capacity).ceil() as i64)
    }
}

/// Token-bucket limiter keeping all buckets in memory.
///
/// Buckets are created full on first use. Models without configured limits
/// are never throttled.
pub struct TokenBucketLimiter {
    limits: RateLimits,
    buckets: Mutex<HashMap<RateLimitKey, Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining capacity of a bucket, for diagnostics.
    pub fn available(&self, key: &RateLimitKey, now: DateTime<Utc>) -> Option<f64> {
        let capacity = self.limits.capacity(key)?;
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(capacity, now));
        bucket.refill(now);
        Some(bucket.tokens)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn try_reserve_all(
        &self,
        reservations: &[(RateLimitKey, u64)],
        now: DateTime<Utc>,
    ) -> Reservation {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let mut wait_ms: Option<i64> = None;
        for (key, count) in reservations {
            let Some(capacity) = self.limits.capacity(key) else {
                continue;
            };
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::full(capacity, now));
            bucket.refill(now);
            if let Some(ms) = bucket.wait_ms(*count) {
                wait_ms = Some(wait_ms.map_or(ms, |w| w.max(ms)));
            }
        }

        if let Some(ms) = wait_ms {
            tracing::debug!(wait_ms = ms, "Rate limit reservation refused");
            return Reservation::refused(now + Duration::milliseconds(ms.max(1)));
        }

        for (key, count) in reservations {
            if let Some(bucket) = buckets.get_mut(key) {
                bucket.tokens -= *count as f64;
            }
        }
        Reservation::granted()
    }

    async fn charge_post_hoc(&self, key: &RateLimitKey, count: u64, now: DateTime<Utc>) {
        let Some(capacity) = self.limits.capacity(key) else {
            return;
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(capacity, now));
        bucket.refill(now);
        bucket.tokens -= count as f64;
        tracing::trace!(key = %key, count, remaining = bucket.tokens, "Charged rate limit post hoc");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> TokenBucketLimiter {
        let limits = RateLimits::default().with_model(
            "gpt-4.1",
            ScopeLimits {
                job: BucketLimits {
                    requests_per_minute: Some(2),
                    ..Default::default()
                },
                batch: BucketLimits {
                    requests_per_minute: Some(600),
                    output_tokens_per_minute: Some(1000),
                    ..Default::default()
                },
            },
        );
        TokenBucketLimiter::new(limits)
    }

    #[tokio::test]
    async fn test_refuses_when_exhausted_and_recovers() {
        let limiter = limiter();
        let key = RateLimitKey::requests("gpt-4.1", LimitScope::Job);
        let now = Utc::now();

        assert!(limiter.try_reserve(&key, 1, now).await.ok);
        assert!(limiter.try_reserve(&key, 1, now).await.ok);

        let refused = limiter.try_reserve(&key, 1, now).await;
        assert!(!refused.ok);
        let retry_after = refused.retry_after.unwrap();
        // 2 per minute refills one token every 30s
        assert_eq!((retry_after - now).num_milliseconds(), 30_000);

        assert!(limiter.try_reserve(&key, 1, retry_after).await.ok);
    }

    #[tokio::test]
    async fn test_unconfigured_model_is_unlimited() {
        let limiter = limiter();
        let key = RateLimitKey::requests("gpt-5.2-chat", LimitScope::Job);
        let res = limiter.try_reserve(&key, 10_000, Utc::now()).await;
        assert!(res.ok);
        assert!(limiter.available(&key, Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_refusal_has_no_side_effects() {
        let limiter = limiter();
        let now = Utc::now();
        let requests = RateLimitKey::requests("gpt-4.1", LimitScope::Batch);
        let output = RateLimitKey::output_tokens("gpt-4.1", LimitScope::Batch);

        limiter.charge_post_hoc(&output, 1500, now).await;
        let res = limiter
            .try_reserve_all(&[(requests.clone(), 10), (output.clone(), 0)], now)
            .await;
        assert!(!res.ok);
        assert_eq!(limiter.available(&requests, now), Some(600.0));
    }

    #[tokio::test]
    async fn test_oversized_reservation_admitted_when_full() {
        let limiter = limiter();
        let key = RateLimitKey::requests("gpt-4.1", LimitScope::Batch);
        let now = Utc::now();
        assert!(limiter.try_reserve(&key, 900, now).await.ok);
        assert!(!limiter.try_reserve(&key, 1, now).await.ok);
    }

    #[test]
    fn test_limits_from_yaml() {
        let limits = RateLimits::from_yaml_str(
            "gpt-4.1:\n  batch:\n    requests_per_minute: 10\n",
        )
        .unwrap();
        let key = RateLimitKey::requests("gpt-4.1", LimitScope::Batch);
        assert_eq!(limits.capacity(&key), Some(10));
        let key = RateLimitKey::requests("gpt-4.1", LimitScope::Job);
        assert_eq!(limits.capacity(&key), None);
    }

    #[tokio::test]
    async fn test_zero_capacity_refuses() {
        let limiter = TokenBucketLimiter::new(RateLimits::default().with_model(
            "gpt-4.1",
            ScopeLimits {
                job: BucketLimits {
                    requests_per_minute: Some(0),
                    ..Default::default()
                },
                ..Default::default()
            },
        ));
        let key = RateLimitKey::requests("gpt-4.1", LimitScope::Job);
        let now = Utc::now();

        let refused = limiter.try_reserve(&key, 1, now).await;
        assert!(!refused.ok);
        assert_eq!(refused.retry_after, Some(now + Duration::minutes(1)));
        assert!(!limiter.try_reserve(&key, 0, now).await.ok);
    }

    #[test]
    fn test_zero_limit_rejected_on_load() {
        let err = RateLimits::from_yaml_str("gpt-4.1:\n  job:\n    requests_per_minute: 0\n")
            .unwrap_err();
        assert!(matches!(err, PolicyError::Invalid(ref msg) if msg.contains("gpt-4.1")));
    }
}
