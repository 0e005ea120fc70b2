//! The seam between the generic engine and pipeline-specific domain logic.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::prompts::PromptPair;
use crate::error::EngineError;
use crate::models::{ProcessKind, Stage};

/// One unit of work for a (process, stage).
#[derive(Debug, Clone, PartialEq)]
pub struct StageTarget {
    pub target_id: Uuid,
    /// Upstream input; `None` while it is not available.
    pub input: Option<String>,
    /// The stage output is already written to the domain row.
    pub output_present: bool,
}

impl StageTarget {
    pub fn is_blocked(&self) -> bool {
        !self.output_present && self.input.is_none()
    }
}

/// Domain callbacks for one process kind.
#[async_trait]
pub trait StageStrategy: Send + Sync {
    fn kind(&self) -> ProcessKind;

    /// Every target of `stage`, whether done, ready or blocked.
    async fn list_targets(
        &self,
        process_id: Uuid,
        stage: Stage,
    ) -> Result<Vec<StageTarget>, EngineError>;

    async fn model_for_stage(&self, process_id: Uuid, stage: Stage) -> Result<String, EngineError>;

    fn build_prompt(&self, stage: Stage, input: &str) -> PromptPair;

    /// Writes the parsed output to the target. Empty output is a
    /// [`EngineError::ParseFailure`].
    async fn apply_result(
        &self,
        target_id: Uuid,
        stage: Stage,
        output: &str,
    ) -> Result<(), EngineError>;

    async fn apply_error(&self, target_id: Uuid, stage: Stage, error: &str)
        -> Result<(), EngineError>;
}

/// Parses raw model output; blank text is rejected.
pub fn parse_output(output: &str) -> Result<String, EngineError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(EngineError::ParseFailure("empty model output".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Strategies keyed by process kind.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    strategies: HashMap<ProcessKind, Arc<dyn StageStrategy>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn StageStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn StageStrategy>) -> Self {
        self.register(strategy);
        self
    }

    /// Unregistered kinds are a configuration error.
    pub fn get(&self, kind: ProcessKind) -> Result<Arc<dyn StageStrategy>, EngineError> {
        self.strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::UnregisteredKind(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<ProcessKind> {
        let mut kinds: Vec<_> = self.strategies.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
