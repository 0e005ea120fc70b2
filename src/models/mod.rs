//! Core data model of the orchestration engine.
//!
//! - [`keys`]: idempotency keys addressing work by process, target and stage
//! - [`catalog`]: known models and providers
//! - [`records`]: persisted requests, jobs, batches and process instances

pub mod catalog;
pub mod keys;
pub mod records;

pub use catalog::{all_models, is_batchable, model_spec, ModelSpec, Provider};
pub use keys::{ProcessKey, ProcessKind, RequestKey, Stage};
pub use records::{
    BatchStatus, DesiredState, JobStatus, LlmBatch, LlmJob, LlmRequest, Process, ProcessPatch,
    ProcessStatus, RequestStatus, Route, SchedulerState, StopAt,
};
