//! Persisted engine records: LLM requests, jobs, batches, process instances
//! and the global scheduler row.
//!
//! Records are plain data. State transitions are performed by the engine
//! components, which write whole records back through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::catalog::Provider;
use super::keys::{ProcessKey, ProcessKind, RequestKey, Stage};
use crate::policy::RunPolicy;

/// Implements `as_str`, `Display` and `FromStr` for a unit-variant status enum.
macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

// ============================================================================
// Requests
// ============================================================================

/// Lifecycle of a single LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting to be executed by its job, or waiting for a retry.
    Pending,
    /// Assigned to a batch that has not been submitted yet.
    Queued,
    /// Part of a batch in flight at the provider.
    Submitted,
    Success,
    Error,
    Canceled,
}

status_strings!(RequestStatus {
    Pending => "pending",
    Queued => "queued",
    Submitted => "submitted",
    Success => "success",
    Error => "error",
    Canceled => "canceled",
});

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Success | RequestStatus::Error | RequestStatus::Canceled
        )
    }
}

/// The single execution vehicle a request is assigned to.
///
/// Modelling the assignment as one optional enum makes "job and batch both
/// set" unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Route {
    Job(Uuid),
    Batch(Uuid),
}

impl Route {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Route::Job(id) => Some(*id),
            Route::Batch(_) => None,
        }
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            Route::Batch(id) => Some(*id),
            Route::Job(_) => None,
        }
    }
}

/// One LLM call bound to one (process, target, stage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub id: Uuid,
    pub model: String,
    pub provider: Provider,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub key: RequestKey,
    pub status: RequestStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub route: Option<Route>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LlmRequest {
    pub fn new(
        key: RequestKey,
        model: impl Into<String>,
        provider: Provider,
        user_prompt: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            provider,
            system_prompt: None,
            user_prompt: user_prompt.into(),
            key,
            status: RequestStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            route: None,
            input_tokens: None,
            output_tokens: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the request may run at `now` (pending and past its backoff).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.route.and_then(|r| r.job_id())
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        self.route.and_then(|r| r.batch_id())
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
}

status_strings!(JobStatus {
    Queued => "queued",
    Running => "running",
    Success => "success",
    Error => "error",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

/// A group of requests executed synchronously, one call at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmJob {
    pub id: Uuid,
    pub provider: Provider,
    pub model: String,
    pub key: ProcessKey,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LlmJob {
    pub fn new(
        key: ProcessKey,
        model: impl Into<String>,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            model: model.into(),
            key,
            status: JobStatus::Queued,
            next_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_run_at.is_none_or(|at| at <= now)
    }
}

// ============================================================================
// Batches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Submitted,
    Running,
    Success,
    Error,
    Canceled,
}

status_strings!(BatchStatus {
    Queued => "queued",
    Submitted => "submitted",
    Running => "running",
    Success => "success",
    Error => "error",
    Canceled => "canceled",
});

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Success | BatchStatus::Error | BatchStatus::Canceled
        )
    }

    /// In flight at the provider.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BatchStatus::Submitted | BatchStatus::Running)
    }
}

/// A group of requests submitted together to a provider batch API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmBatch {
    pub id: Uuid,
    pub provider: Provider,
    pub model: String,
    pub key: ProcessKey,
    pub status: BatchStatus,
    pub provider_batch_ref: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LlmBatch {
    pub fn new(
        key: ProcessKey,
        model: impl Into<String>,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            model: model.into(),
            key,
            status: BatchStatus::Queued,
            provider_batch_ref: None,
            locked_until: None,
            next_poll_at: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_poll_at.is_none_or(|at| at <= now)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

// ============================================================================
// Process instances
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Start,
    Queued,
    Running,
    Paused,
    Completed,
    Canceled,
    Error,
}

status_strings!(ProcessStatus {
    Start => "start",
    Queued => "queued",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Canceled => "canceled",
    Error => "error",
});

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Canceled | ProcessStatus::Error
        )
    }

    /// Non-terminal statuses; their policies shape the global scheduler.
    pub const ACTIVE: [ProcessStatus; 4] = [
        ProcessStatus::Start,
        ProcessStatus::Queued,
        ProcessStatus::Running,
        ProcessStatus::Paused,
    ];
}

/// What the user asked for, independent of what the machine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Paused,
    Canceled,
}

status_strings!(DesiredState {
    Running => "running",
    Paused => "paused",
    Canceled => "canceled",
});

/// One instance of a pipeline (a window or a run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub kind: ProcessKind,
    pub status: ProcessStatus,
    pub desired_state: DesiredState,
    pub current_stage: Stage,
    pub stop_at_stage: Option<Stage>,
    /// Policy resolved at creation time; never re-resolved.
    pub policy: RunPolicy,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    pub fn new(id: Uuid, kind: ProcessKind, policy: RunPolicy, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            status: ProcessStatus::Start,
            desired_state: DesiredState::Running,
            current_stage: kind.first_stage(),
            stop_at_stage: None,
            policy,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stop_at_stage(mut self, stage: Stage) -> Self {
        self.stop_at_stage = Some(stage);
        self
    }

    /// Whether `stage` lies beyond the configured stop stage.
    pub fn is_past_stop(&self, stage: Stage) -> bool {
        match self.stop_at_stage {
            Some(stop) => {
                self.kind.stage_index(stage) > self.kind.stage_index(stop)
            }
            None => false,
        }
    }
}

/// What a conditional process update does with `stop_at_stage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopAt {
    #[default]
    Keep,
    Clear,
    /// Pin to the stored `current_stage` unless a stop stage is already set.
    PinCurrent,
}

impl StopAt {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopAt::Keep => "keep",
            StopAt::Clear => "clear",
            StopAt::PinCurrent => "pin_current",
        }
    }
}

/// Fields a conditional process update may change.
///
/// `current_stage` only moves through `Store::advance_stage` and the policy
/// snapshot never changes, so neither appears here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessPatch {
    pub status: Option<ProcessStatus>,
    pub desired_state: Option<DesiredState>,
    pub stop_at: StopAt,
    pub last_error: Option<String>,
}

impl ProcessPatch {
    pub fn status(status: ProcessStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn desired_state(desired: DesiredState) -> Self {
        Self {
            desired_state: Some(desired),
            ..Self::default()
        }
    }

    pub fn with_desired_state(mut self, desired: DesiredState) -> Self {
        self.desired_state = Some(desired);
        self
    }

    pub fn with_stop_at(mut self, stop_at: StopAt) -> Self {
        self.stop_at = stop_at;
        self
    }

    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Applies the patch to an in-memory copy.
    pub fn apply(&self, process: &mut Process, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            process.status = status;
        }
        if let Some(desired) = self.desired_state {
            process.desired_state = desired;
        }
        match self.stop_at {
            StopAt::Keep => {}
            StopAt::Clear => process.stop_at_stage = None,
            StopAt::PinCurrent => {
                process.stop_at_stage.get_or_insert(process.current_stage);
            }
        }
        if let Some(error) = &self.last_error {
            process.last_error = Some(error.clone());
        }
        process.updated_at = now;
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// The single row guarding the global scheduler loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub locked_until: Option<DateTime<Utc>>,
    pub next_tick_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}
