//! Shared collaborators handed to every engine component.

use std::sync::Arc;

use super::config::EngineConfig;
use crate::llm::{BatchClient, ChatClient};
use crate::metrics::MetricsCollector;
use crate::pipeline::PipelineRegistry;
use crate::ratelimit::{RateLimiter, Unlimited};
use crate::storage::Store;

/// Everything the engines need, cheap to share behind an `Arc`.
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub registry: PipelineRegistry,
    pub limiter: Arc<dyn RateLimiter>,
    pub chat: Arc<dyn ChatClient>,
    pub batch_client: Arc<dyn BatchClient>,
    pub config: EngineConfig,
    pub metrics: MetricsCollector,
}

impl EngineContext {
    /// Context with no rate limits and default configuration.
    pub fn new(
        store: Arc<dyn Store>,
        registry: PipelineRegistry,
        chat: Arc<dyn ChatClient>,
        batch_client: Arc<dyn BatchClient>,
    ) -> Self {
        Self {
            store,
            registry,
            limiter: Arc::new(Unlimited),
            chat,
            batch_client,
            config: EngineConfig::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn batch_lock(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.batch_lock_ms as i64)
    }
}
