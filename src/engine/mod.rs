//! The orchestration engine.
//!
//! Components are small handles over a shared [`EngineContext`] and are
//! constructed where needed:
//!
//! - [`Orchestrator`]: turns a stage's pending targets into requests routed
//!   to a single job or batch
//! - [`JobEngine`]: synchronous execution of job requests
//! - [`BatchEngine`]: provider batch submission and polling
//! - [`StageMachine`]: stage accounting and advancement
//! - [`ProcessLifecycle`]: create, start, pause, resume and cancel
//!
//! Every operation takes `now` explicitly; nothing reads the wall clock.

pub mod batches;
pub mod config;
pub mod context;
pub mod jobs;
pub mod lifecycle;
pub mod orchestrator;
pub mod outcomes;
pub mod router;
pub mod stages;

pub use batches::{BatchEngine, BatchStep};
pub use config::{ConfigError, EngineConfig};
pub use context::EngineContext;
pub use jobs::{JobEngine, JobReport};
pub use lifecycle::ProcessLifecycle;
pub use orchestrator::{EnqueueOutcome, Orchestrator};
pub use outcomes::Resolution;
pub use router::{decide, RouteDecision};
pub use stages::{StageCounts, StageMachine, StageOutcome};
