//! Prometheus metrics registration and export.
//!
//! All engine metrics live in one registry held in `OnceLock` statics.
//! Recording before [`init_metrics`] is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all eval_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Scheduler ticks, labeled by outcome (`ran` / `locked`).
pub static SCHEDULER_TICKS: OnceLock<CounterVec> = OnceLock::new();

/// Wall time of ticks that took the lock.
pub static TICK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Batch polls, labeled by outcome (`running`, `completed`, `error`, `locked`).
pub static BATCH_POLLS: OnceLock<CounterVec> = OnceLock::new();

/// Resolved requests, labeled by model and status.
pub static REQUEST_OUTCOMES: OnceLock<CounterVec> = OnceLock::new();

/// Tokens charged, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage machine transitions, labeled by process kind and outcome.
pub static STAGE_TRANSITIONS: OnceLock<CounterVec> = OnceLock::new();

/// Processes in a non-terminal status at the last tick.
pub static ACTIVE_PROCESSES: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    let scheduler_ticks = CounterVec::new(
        Opts::new("eval_forge_scheduler_ticks_total", "Scheduler ticks"),
        &["outcome"],
    )?;

    let tick_duration = Histogram::with_opts(
        HistogramOpts::new(
            "eval_forge_tick_duration_seconds",
            "Duration of scheduler ticks in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    let batch_polls = CounterVec::new(
        Opts::new("eval_forge_batch_polls_total", "Provider batch polls"),
        &["outcome"],
    )?;

    let request_outcomes = CounterVec::new(
        Opts::new(
            "eval_forge_request_outcomes_total",
            "LLM requests resolved by the engines",
        ),
        &["model", "status"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("eval_forge_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let stage_transitions = CounterVec::new(
        Opts::new(
            "eval_forge_stage_transitions_total",
            "Process stage transitions",
        ),
        &["kind", "outcome"],
    )?;

    let active_processes = Gauge::new(
        "eval_forge_active_processes",
        "Processes not yet in a terminal status",
    )?;

    registry.register(Box::new(scheduler_ticks.clone()))?;
    registry.register(Box::new(tick_duration.clone()))?;
    registry.register(Box::new(batch_polls.clone()))?;
    registry.register(Box::new(request_outcomes.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(stage_transitions.clone()))?;
    registry.register(Box::new(active_processes.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = SCHEDULER_TICKS.set(scheduler_ticks);
    let _ = TICK_DURATION.set(tick_duration);
    let _ = BATCH_POLLS.set(batch_polls);
    let _ = REQUEST_OUTCOMES.set(request_outcomes);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = STAGE_TRANSITIONS.set(stage_transitions);
    let _ = ACTIVE_PROCESSES.set(active_processes);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
