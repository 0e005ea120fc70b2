//! Evidence processing: clean, neutralize and abstract every evidence row of
//! a window. The process id is the window id.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::domain::EvidenceRepository;
use super::prompts::{build_stage_prompt, PromptPair};
use super::strategy::{parse_output, StageStrategy, StageTarget};
use crate::error::{EngineError, StoreError};
use crate::models::{ProcessKind, Stage};

pub struct EvidencePipeline {
    repo: Arc<dyn EvidenceRepository>,
}

impl EvidencePipeline {
    pub fn new(repo: Arc<dyn EvidenceRepository>) -> Self {
        Self { repo }
    }

    fn check_stage(stage: Stage) -> Result<(), EngineError> {
        if stage.kind() != ProcessKind::Window {
            return Err(EngineError::StageNotInPipeline {
                kind: ProcessKind::Window.to_string(),
                stage: stage.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StageStrategy for EvidencePipeline {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Window
    }

    async fn list_targets(
        &self,
        process_id: Uuid,
        stage: Stage,
    ) -> Result<Vec<StageTarget>, EngineError> {
        Self::check_stage(stage)?;
        if self.repo.get_window(process_id).await?.is_none() {
            return Err(EngineError::ProcessNotFound(process_id));
        }

        let evidence = self.repo.list_evidence(process_id).await?;
        Ok(evidence
            .iter()
            .map(|e| StageTarget {
                target_id: e.id,
                input: e.stage_input(stage).map(str::to_string),
                output_present: e.stage_output(stage).is_some(),
            })
            .collect())
    }

    async fn model_for_stage(&self, process_id: Uuid, stage: Stage) -> Result<String, EngineError> {
        Self::check_stage(stage)?;
        let window = self
            .repo
            .get_window(process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_id))?;
        Ok(window.model)
    }

    fn build_prompt(&self, stage: Stage, input: &str) -> PromptPair {
        build_stage_prompt(stage, input)
    }

    async fn apply_result(
        &self,
        target_id: Uuid,
        stage: Stage,
        output: &str,
    ) -> Result<(), EngineError> {
        Self::check_stage(stage)?;
        let text = parse_output(output)?;
        let mut evidence = self
            .repo
            .get_evidence(target_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("evidence {}", target_id)))?;
        evidence.set_stage_output(stage, text);
        evidence.last_error = None;
        self.repo.put_evidence(&evidence).await?;
        Ok(())
    }

    async fn apply_error(
        &self,
        target_id: Uuid,
        stage: Stage,
        error: &str,
    ) -> Result<(), EngineError> {
        Self::check_stage(stage)?;
        let Some(mut evidence) = self.repo.get_evidence(target_id).await? else {
            tracing::warn!(target_id = %target_id, "Evidence vanished before error could be recorded");
            return Ok(());
        };
        evidence.last_error = Some(format!("{}: {}", stage, error));
        self.repo.put_evidence(&evidence).await?;
        Ok(())
    }
}
