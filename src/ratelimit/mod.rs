//! Rate-limit coordination for provider traffic.
//!
//! Limits are tracked per (model, scope, metric). The scope separates
//! synchronous job traffic from batch traffic, and the metric is one of
//! request count, input tokens or output tokens. The engine only needs two
//! operations: a non-blocking reservation that either succeeds or reports
//! when to try again, and an unconditional post-hoc charge for usage that is
//! only known after the fact.

mod bucket;

pub use bucket::{BucketLimits, RateLimits, ScopeLimits, TokenBucketLimiter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Which traffic class a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    Job,
    Batch,
}

/// What a bucket counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitMetric {
    Requests,
    InputTokens,
    OutputTokens,
}

impl LimitMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitMetric::Requests => "requests",
            LimitMetric::InputTokens => "input_tokens",
            LimitMetric::OutputTokens => "output_tokens",
        }
    }
}

/// Identifies one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub model: String,
    pub scope: LimitScope,
    pub metric: LimitMetric,
}

impl RateLimitKey {
    pub fn new(model: impl Into<String>, scope: LimitScope, metric: LimitMetric) -> Self {
        Self {
            model: model.into(),
            scope,
            metric,
        }
    }

    pub fn requests(model: &str, scope: LimitScope) -> Self {
        Self::new(model, scope, LimitMetric::Requests)
    }

    pub fn input_tokens(model: &str, scope: LimitScope) -> Self {
        Self::new(model, scope, LimitMetric::InputTokens)
    }

    pub fn output_tokens(model: &str, scope: LimitScope) -> Self {
        Self::new(model, scope, LimitMetric::OutputTokens)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            LimitScope::Job => write!(f, "{}:{}", self.model, self.metric.as_str()),
            LimitScope::Batch => write!(f, "batch_{}:{}", self.model, self.metric.as_str()),
        }
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub ok: bool,
    /// Earliest time a retry can succeed, set when `ok` is false.
    pub retry_after: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn granted() -> Self {
        Self {
            ok: true,
            retry_after: None,
        }
    }

    pub fn refused(retry_after: DateTime<Utc>) -> Self {
        Self {
            ok: false,
            retry_after: Some(retry_after),
        }
    }
}

/// Shared rate limiter used by the job and batch engines.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Atomically reserves every `(key, count)` pair or none of them.
    async fn try_reserve_all(
        &self,
        reservations: &[(RateLimitKey, u64)],
        now: DateTime<Utc>,
    ) -> Reservation;

    /// Consumes capacity unconditionally, possibly into debt.
    async fn charge_post_hoc(&self, key: &RateLimitKey, count: u64, now: DateTime<Utc>);

    async fn try_reserve(&self, key: &RateLimitKey, count: u64, now: DateTime<Utc>) -> Reservation {
        self.try_reserve_all(&[(key.clone(), count)], now).await
    }
}

/// A limiter that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn try_reserve_all(
        &self,
        _reservations: &[(RateLimitKey, u64)],
        _now: DateTime<Utc>,
    ) -> Reservation {
        Reservation::granted()
    }

    async fn charge_post_hoc(&self, _key: &RateLimitKey, _count: u64, _now: DateTime<Utc>) {}
}
