//! Work selection for a scheduler tick.
//!
//! The tick shapes itself from the policies of every active process: it
//! polls as often as the most eager process wants, and creates or polls as
//! little per tick as the most conservative process allows.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{DesiredState, LlmBatch, LlmJob, Process, ProcessKey, ProcessStatus, Provider};
use crate::policy::RunPolicy;

/// Effective per-tick limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingPolicy {
    pub poll_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_new_batches_per_tick: usize,
    pub max_poll_per_tick: usize,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self::from_policy(&RunPolicy::default())
    }
}

impl SchedulingPolicy {
    fn from_policy(policy: &RunPolicy) -> Self {
        Self {
            poll_interval_ms: policy.poll_interval_ms,
            max_batch_size: policy.max_batch_size,
            max_new_batches_per_tick: policy.max_new_batches_per_tick,
            max_poll_per_tick: policy.max_poll_per_tick,
        }
    }

    /// Most conservative union of `policies`; the default policy when empty.
    pub fn union<'a>(policies: impl IntoIterator<Item = &'a RunPolicy>) -> Self {
        let mut policies = policies.into_iter();
        let Some(first) = policies.next() else {
            return Self::default();
        };
        policies.fold(Self::from_policy(first), |acc, p| Self {
            poll_interval_ms: acc.poll_interval_ms.min(p.poll_interval_ms),
            max_batch_size: acc.max_batch_size.max(p.max_batch_size),
            max_new_batches_per_tick: acc.max_new_batches_per_tick.min(p.max_new_batches_per_tick),
            max_poll_per_tick: acc.max_poll_per_tick.min(p.max_poll_per_tick),
        })
    }

    /// Delay before the next tick.
    pub fn next_tick_delay(&self, min_delay_ms: u64) -> Duration {
        Duration::milliseconds(self.poll_interval_ms.max(min_delay_ms) as i64)
    }
}

/// Why queued work was held back this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ProcessInactive,
    ModelNotAllowed,
    ConcurrencyCap,
    PastStopStage,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ProcessInactive => "process_inactive",
            SkipReason::ModelNotAllowed => "model_not_allowed",
            SkipReason::ConcurrencyCap => "concurrency_cap",
            SkipReason::PastStopStage => "past_stop_stage",
        }
    }
}

/// Checks whether queued work for `key` may be launched.
///
/// `in_flight` is the number of the process's batches currently at the
/// provider; only batch work is subject to `max_concurrent_batches`.
pub fn skip_reason(
    process: &Process,
    key: &ProcessKey,
    provider: Provider,
    model: &str,
    in_flight: Option<usize>,
) -> Option<SkipReason> {
    if process.desired_state == DesiredState::Canceled
        || !matches!(process.status, ProcessStatus::Running | ProcessStatus::Paused)
    {
        return Some(SkipReason::ProcessInactive);
    }
    if !process.policy.allows_model(provider, model) {
        return Some(SkipReason::ModelNotAllowed);
    }
    if let (Some(cap), Some(count)) = (process.policy.max_concurrent_batches, in_flight) {
        if count >= cap {
            return Some(SkipReason::ConcurrencyCap);
        }
    }
    if process.is_past_stop(key.stage) {
        return Some(SkipReason::PastStopStage);
    }
    None
}

/// Queued work waiting to be launched.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Batch(LlmBatch),
    Job(LlmJob),
}

impl Candidate {
    pub fn id(&self) -> Uuid {
        match self {
            Candidate::Batch(b) => b.id,
            Candidate::Job(j) => j.id,
        }
    }

    pub fn key(&self) -> ProcessKey {
        match self {
            Candidate::Batch(b) => b.key,
            Candidate::Job(j) => j.key,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Candidate::Batch(b) => b.provider,
            Candidate::Job(j) => j.provider,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Candidate::Batch(b) => &b.model,
            Candidate::Job(j) => &j.model,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Candidate::Batch(_))
    }

    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Candidate::Batch(b) => b.created_at,
            Candidate::Job(j) => j.created_at,
        }
    }
}

/// Oldest-first launch order with at most one batch and one job per
/// (provider, model) pair, capped at `limit` in total.
///
/// Candidates that lose their slot stay queued for a later tick.
pub fn one_per_model(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.sort_by_key(|c| c.created_at());
    let mut taken: HashSet<(Provider, String, bool)> = HashSet::new();
    let mut selected = Vec::new();
    for candidate in candidates {
        if selected.len() >= limit {
            break;
        }
        let slot = (candidate.provider(), candidate.model().to_string(), candidate.is_batch());
        if taken.insert(slot) {
            selected.push(candidate);
        }
    }
    selected
}

/// Due in-flight batches to poll, oldest poll time first, within the global
/// cap and each process's own `max_poll_per_tick`.
pub fn due_polls(
    mut batches: Vec<LlmBatch>,
    process_caps: &HashMap<Uuid, usize>,
    global_cap: usize,
    now: DateTime<Utc>,
) -> Vec<LlmBatch> {
    batches.retain(|b| b.status.is_in_flight() && b.is_due(now) && !b.is_locked(now));
    batches.sort_by_key(|b| b.next_poll_at.unwrap_or(b.created_at));

    let mut per_process: HashMap<Uuid, usize> = HashMap::new();
    let mut selected = Vec::new();
    for batch in batches {
        if selected.len() >= global_cap {
            break;
        }
        let pid = batch.key.process_id;
        let count = per_process.entry(pid).or_insert(0);
        if let Some(cap) = process_caps.get(&pid) {
            if *count >= *cap {
                continue;
            }
        }
        *count += 1;
        selected.push(batch);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchStatus, ProcessKind, Stage};

    fn policy(poll: u64, max_batch: usize, new_per_tick: usize, polls: usize) -> RunPolicy {
        RunPolicy {
            poll_interval_ms: poll,
            max_batch_size: max_batch,
            max_new_batches_per_tick: new_per_tick,
            max_poll_per_tick: polls,
            ..RunPolicy::default()
        }
    }

    fn batch(pid: Uuid, model: &str, created_at: DateTime<Utc>) -> LlmBatch {
        let key = ProcessKey::new(ProcessKind::Window, pid, Stage::EvidenceClean);
        LlmBatch::new(key, model, Provider::Openai, created_at)
    }

    fn running_process(policy: RunPolicy) -> Process {
        let mut process = Process::new(Uuid::new_v4(), ProcessKind::Window, policy, Utc::now());
        process.status = ProcessStatus::Running;
        process
    }

    #[test]
    fn test_union_is_most_conservative() {
        let a = policy(5000, 100, 4, 10);
        let b = policy(2000, 300, 2, 20);
        let union = SchedulingPolicy::union([&a, &b]);
        assert_eq!(union.poll_interval_ms, 2000);
        assert_eq!(union.max_batch_size, 300);
        assert_eq!(union.max_new_batches_per_tick, 2);
        assert_eq!(union.max_poll_per_tick, 10);
    }

    #[test]
    fn test_union_of_nothing_is_default() {
        let union = SchedulingPolicy::union(std::iter::empty());
        assert_eq!(union, SchedulingPolicy::default());
        assert_eq!(union.poll_interval_ms, 5000);
    }

    #[test]
    fn test_next_tick_delay_respects_minimum() {
        let union = SchedulingPolicy::union([&policy(500, 10, 1, 1)]);
        assert_eq!(union.next_tick_delay(1000), Duration::milliseconds(1000));
        assert_eq!(union.next_tick_delay(100), Duration::milliseconds(500));
    }

    #[test]
    fn test_skip_reasons() {
        let process = running_process(RunPolicy::default());
        let key = ProcessKey::new(ProcessKind::Window, process.id, Stage::EvidenceClean);
        assert_eq!(skip_reason(&process, &key, Provider::Openai, "gpt-4.1", Some(0)), None);
        assert_eq!(
            skip_reason(&process, &key, Provider::Openai, "gpt-4o", None),
            Some(SkipReason::ModelNotAllowed)
        );

        let mut canceled = process.clone();
        canceled.status = ProcessStatus::Canceled;
        assert_eq!(
            skip_reason(&canceled, &key, Provider::Openai, "gpt-4.1", None),
            Some(SkipReason::ProcessInactive)
        );

        let capped = running_process(RunPolicy {
            max_concurrent_batches: Some(1),
            ..RunPolicy::default()
        });
        assert_eq!(
            skip_reason(&capped, &key, Provider::Openai, "gpt-4.1", Some(1)),
            Some(SkipReason::ConcurrencyCap)
        );
        assert_eq!(skip_reason(&capped, &key, Provider::Openai, "gpt-4.1", None), None);

        let stopped = process.with_stop_at_stage(Stage::EvidenceClean);
        let later = ProcessKey::new(ProcessKind::Window, stopped.id, Stage::EvidenceAbstract);
        assert_eq!(
            skip_reason(&stopped, &later, Provider::Openai, "gpt-4.1", None),
            Some(SkipReason::PastStopStage)
        );
    }

    #[test]
    fn test_one_per_model_caps_total() {
        let now = Utc::now();
        let pid = Uuid::new_v4();
        let first = batch(pid, "gpt-4.1", now);
        let second = batch(pid, "gpt-4.1", now + Duration::seconds(1));
        let other = batch(pid, "gpt-5.2", now + Duration::seconds(2));
        let job = LlmJob::new(first.key, "gpt-4.1", Provider::Openai, now);

        let selected = one_per_model(
            vec![
                Candidate::Batch(second.clone()),
                Candidate::Batch(other.clone()),
                Candidate::Batch(first.clone()),
                Candidate::Job(job.clone()),
            ],
            10,
        );
        let ids: Vec<Uuid> = selected.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&first.id));
        assert!(ids.contains(&other.id));
        assert!(ids.contains(&job.id));
        assert!(!ids.contains(&second.id));

        let capped = one_per_model(vec![Candidate::Batch(first), Candidate::Batch(other)], 1);
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_due_polls_applies_caps() {
        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut batches = Vec::new();
        for (i, pid) in [a, a, a, b].into_iter().enumerate() {
            let mut batch = batch(pid, "gpt-4.1", now - Duration::seconds(10 - i as i64));
            batch.status = BatchStatus::Submitted;
            batches.push(batch);
        }
        let mut future = batch(b, "gpt-4.1", now);
        future.status = BatchStatus::Running;
        future.next_poll_at = Some(now + Duration::seconds(30));
        batches.push(future);

        let caps = HashMap::from([(a, 2), (b, 5)]);
        let selected = due_polls(batches.clone(), &caps, 10, now);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected.iter().filter(|x| x.key.process_id == a).count(), 2);

        let selected = due_polls(batches, &caps, 1, now);
        assert_eq!(selected.len(), 1);
    }
}
