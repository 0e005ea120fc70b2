//! Batch-versus-job routing.

use crate::policy::RunPolicy;

/// Where a group of new requests is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Batch,
    Job,
}

/// Pure routing decision for `count` requests on a model.
pub fn decide(batchable: bool, count: usize, policy: &RunPolicy) -> RouteDecision {
    if !batchable {
        return RouteDecision::Job;
    }
    if count < policy.min_batch_size {
        return RouteDecision::Job;
    }
    if count <= policy.job_fallback_count {
        return RouteDecision::Job;
    }
    RouteDecision::Batch
}
