//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_PROCESSES, BATCH_POLLS, LLM_TOKENS_TOTAL, REQUEST_OUTCOMES, SCHEDULER_TICKS,
    STAGE_TRANSITIONS, TICK_DURATION,
};

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Builds usage from optional provider counts, treating absence as zero.
    pub fn from_counts(input_tokens: Option<u64>, output_tokens: Option<u64>) -> Self {
        Self::new(input_tokens.unwrap_or(0), output_tokens.unwrap_or(0))
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Records engine metrics with consistent labels.
///
/// Every method is a no-op until `init_metrics()` has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one tick attempt; `duration_secs` is only observed for ticks that ran.
    pub fn record_tick(&self, ran: bool, duration_secs: f64) {
        let outcome = if ran { "ran" } else { "locked" };
        if let Some(ticks) = SCHEDULER_TICKS.get() {
            ticks.with_label_values(&[outcome]).inc();
        }
        if ran {
            if let Some(duration) = TICK_DURATION.get() {
                duration.observe(duration_secs);
            }
        }
    }

    pub fn record_batch_poll(&self, outcome: &str) {
        if let Some(polls) = BATCH_POLLS.get() {
            polls.with_label_values(&[outcome]).inc();
        }
        tracing::trace!(outcome, "Recorded batch poll metric");
    }

    pub fn record_request_outcome(&self, model: &str, status: &str) {
        if let Some(outcomes) = REQUEST_OUTCOMES.get() {
            outcomes.with_label_values(&[model, status]).inc();
        }
    }

    pub fn record_tokens(&self, model: &str, tokens: TokenUsage) {
        if let Some(total) = LLM_TOKENS_TOTAL.get() {
            total
                .with_label_values(&[model, "input"])
                .inc_by(tokens.input_tokens as f64);
            total
                .with_label_values(&[model, "output"])
                .inc_by(tokens.output_tokens as f64);
        }
    }

    pub fn record_stage_transition(&self, kind: &str, outcome: &str) {
        if let Some(transitions) = STAGE_TRANSITIONS.get() {
            transitions.with_label_values(&[kind, outcome]).inc();
        }
        tracing::trace!(kind, outcome, "Recorded stage transition metric");
    }

    pub fn set_active_processes(&self, count: usize) {
        if let Some(active) = ACTIVE_PROCESSES.get() {
            active.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_token_usage() {
        let mut usage = TokenUsage::from_counts(Some(10), None);
        usage.add(TokenUsage::new(5, 7));
        assert_eq!(usage, TokenUsage::new(15, 7));
        assert_eq!(usage.total(), 22);
    }

    #[test]
    fn test_collector_records() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();
        collector.record_tick(true, 0.2);
        collector.record_batch_poll("completed");
        collector.record_request_outcome("gpt-4.1", "success");
        collector.record_tokens("gpt-4.1", TokenUsage::new(3, 4));
        collector.record_stage_transition("window", "advanced");
        collector.set_active_processes(2);

        let text = export_metrics();
        assert!(text.contains("eval_forge_request_outcomes_total"));
        assert!(text.contains("eval_forge_active_processes"));
    }
}
