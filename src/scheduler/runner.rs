//! Background loop driving scheduler ticks.
//!
//! The loop runs as a single tokio task. After each tick it sleeps until the
//! persisted `next_tick_at`, bounded by a maximum idle interval, and stops
//! when a shutdown signal is broadcast.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::tick::Scheduler;
use crate::engine::EngineContext;

/// Errors that can occur in the scheduler loop.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Loop is already running.
    #[error("Scheduler loop is already running")]
    AlreadyRunning,

    /// Loop is not running.
    #[error("Scheduler loop is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Longest sleep between ticks, even when the next tick is further out.
    pub max_idle: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl LoopConfig {
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Counters for the lifetime of a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks_run: u64,
    /// Ticks that found the scheduler lock held.
    pub ticks_skipped: u64,
    pub tick_errors: u64,
}

#[derive(Default)]
struct SharedLoopStats {
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    tick_errors: AtomicU64,
}

impl SharedLoopStats {
    fn snapshot(&self) -> LoopStats {
        LoopStats {
            ticks_run: self.ticks_run.load(Ordering::SeqCst),
            ticks_skipped: self.ticks_skipped.load(Ordering::SeqCst),
            tick_errors: self.tick_errors.load(Ordering::SeqCst),
        }
    }
}

/// Runs [`Scheduler::tick`] repeatedly on a background task.
pub struct SchedulerLoop {
    config: LoopConfig,
    ctx: Arc<EngineContext>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SharedLoopStats>,
    is_running: AtomicBool,
}

impl SchedulerLoop {
    pub fn new(ctx: Arc<EngineContext>, config: LoopConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            ctx,
            shutdown_tx,
            handle: None,
            stats: Arc::new(SharedLoopStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the loop task.
    pub fn start(&mut self) -> Result<(), LoopError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(LoopError::AlreadyRunning);
        }

        let scheduler = Scheduler::new(self.ctx.clone());
        let ctx = self.ctx.clone();
        let stats = Arc::clone(&self.stats);
        let max_idle = self.config.max_idle;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            info!("Scheduler loop started");
            loop {
                match scheduler.tick(Utc::now()).await {
                    Ok(report) if report.ran => {
                        stats.ticks_run.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(_) => {
                        stats.ticks_skipped.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        stats.tick_errors.fetch_add(1, Ordering::SeqCst);
                        error!(error = %e, "Scheduler tick failed");
                    }
                }

                let wait = next_wait(&ctx, max_idle).await;
                debug!(wait_ms = wait.as_millis() as u64, "Waiting for next tick");
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scheduler loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }));

        Ok(())
    }

    /// Signals the loop to stop and waits for the in-progress tick to finish.
    pub async fn shutdown(&mut self) -> Result<(), LoopError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(LoopError::NotRunning);
        }

        info!("Initiating scheduler loop shutdown");
        // Ignore send error - the task may have already stopped
        let _ = self.shutdown_tx.send(());

        let Some(handle) = self.handle.take() else {
            self.is_running.store(false, Ordering::SeqCst);
            return Ok(());
        };
        let result = tokio::time::timeout(self.config.shutdown_timeout, handle).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(Ok(())) => {
                info!("Scheduler loop shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Scheduler loop task panicked");
                Ok(())
            }
            Err(_) => Err(LoopError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Time until the persisted next tick, at least the minimum delay and at
/// most `max_idle`.
async fn next_wait(ctx: &EngineContext, max_idle: Duration) -> Duration {
    let min_delay = Duration::from_millis(ctx.config.scheduler_min_delay_ms);
    let next_tick_at = match ctx.store.get_scheduler_state().await {
        Ok(state) => state.next_tick_at,
        Err(e) => {
            warn!(error = %e, "Failed to read scheduler state");
            None
        }
    };
    let Some(at) = next_tick_at else {
        return min_delay;
    };
    let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    until.clamp(min_delay, max_idle.max(min_delay))
}
