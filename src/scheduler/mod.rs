//! Global scheduler: the single time-driven loop of the engine.
//!
//! - **Scheduler**: one lock-guarded tick that launches queued processes,
//!   polls due batches, continues due jobs and starts new batches and jobs
//! - **SchedulerLoop**: runs ticks on a background task until shutdown
//!
//! # Tick
//!
//! ```text
//!   try_lock ──► launch queued processes
//!                       │
//!                       ▼
//!               union policy of active processes
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   poll due batches          continue due jobs
//!          └────────────┬────────────┘
//!                       ▼
//!        submit queued batches / start queued jobs
//!                       │
//!                       ▼
//!           release lock, set next_tick_at
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use eval_forge::scheduler::{LoopConfig, Scheduler, SchedulerLoop};
//!
//! let report = Scheduler::new(ctx.clone()).tick(chrono::Utc::now()).await?;
//!
//! let mut scheduler = SchedulerLoop::new(ctx, LoopConfig::default());
//! scheduler.start()?;
//! tokio::signal::ctrl_c().await?;
//! scheduler.shutdown().await?;
//! ```

pub mod candidates;
pub mod runner;
pub mod tick;

pub use candidates::{Candidate, SchedulingPolicy, SkipReason};
pub use runner::{LoopConfig, LoopError, LoopStats, SchedulerLoop};
pub use tick::{Scheduler, TickReport};
