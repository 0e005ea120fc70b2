//! eval_forge: LLM-call orchestration and scheduling for evaluation pipelines.
//!
//! Multi-stage pipelines (evidence cleaning, rubric and score generation) are
//! driven to completion by routing their LLM calls to provider batches or
//! synchronous jobs, retrying failures, respecting rate limits and advancing
//! each process stage by stage under a single global scheduler.

pub mod cli;
pub mod engine;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod ratelimit;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{EngineError, KeyError, LlmError, PolicyError, StoreError};
