//! Domain rows the pipelines read from and write stage outputs into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Stage;

/// Which semantic level of evidence text a consumer sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceView {
    Raw,
    Cleaned,
    Neutralized,
    #[default]
    Abstracted,
}

impl EvidenceView {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceView::Raw => "raw",
            EvidenceView::Cleaned => "cleaned",
            EvidenceView::Neutralized => "neutralized",
            EvidenceView::Abstracted => "abstracted",
        }
    }
}

impl std::str::FromStr for EvidenceView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(EvidenceView::Raw),
            "cleaned" => Ok(EvidenceView::Cleaned),
            "neutralized" => Ok(EvidenceView::Neutralized),
            "abstracted" => Ok(EvidenceView::Abstracted),
            other => Err(format!("unknown evidence view '{}'", other)),
        }
    }
}

/// A collection of evidence processed together by one window process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub id: Uuid,
    pub model: String,
}

/// One evidence document and its progressively processed forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub window_id: Uuid,
    pub raw: String,
    pub cleaned: Option<String>,
    pub neutralized: Option<String>,
    pub abstracted: Option<String>,
    pub last_error: Option<String>,
}

impl Evidence {
    pub fn new(window_id: Uuid, raw: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            window_id,
            raw: raw.into(),
            cleaned: None,
            neutralized: None,
            abstracted: None,
            last_error: None,
        }
    }

    pub fn content(&self, view: EvidenceView) -> Option<&str> {
        match view {
            EvidenceView::Raw => Some(self.raw.as_str()),
            EvidenceView::Cleaned => self.cleaned.as_deref(),
            EvidenceView::Neutralized => self.neutralized.as_deref(),
            EvidenceView::Abstracted => self.abstracted.as_deref(),
        }
    }

    /// The text a stage consumes.
    pub fn stage_input(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::EvidenceClean => Some(self.raw.as_str()),
            Stage::EvidenceNeutralize => self.cleaned.as_deref(),
            Stage::EvidenceAbstract => self.neutralized.as_deref(),
            _ => None,
        }
    }

    /// The text a stage produces, if already written.
    pub fn stage_output(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::EvidenceClean => self.cleaned.as_deref(),
            Stage::EvidenceNeutralize => self.neutralized.as_deref(),
            Stage::EvidenceAbstract => self.abstracted.as_deref(),
            _ => None,
        }
    }

    pub fn set_stage_output(&mut self, stage: Stage, output: String) {
        match stage {
            Stage::EvidenceClean => self.cleaned = Some(output),
            Stage::EvidenceNeutralize => self.neutralized = Some(output),
            Stage::EvidenceAbstract => self.abstracted = Some(output),
            _ => {}
        }
    }
}

/// Experiment configuration shared by its runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub concept: String,
    pub scale_size: u32,
    pub rubric_model: String,
    pub scoring_model: String,
    pub evidence_view: EvidenceView,
    /// Window whose evidence is scored.
    pub evidence_window_id: Uuid,
}

/// One run of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub experiment_id: Uuid,
}

/// One sample inside a run: a rubric and a score, each with a critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: Uuid,
    pub run_id: Uuid,
    pub seed: u32,
    pub rubric: Option<String>,
    pub rubric_critique: Option<String>,
    pub score: Option<String>,
    pub score_critique: Option<String>,
    pub last_error: Option<String>,
}

impl Sample {
    pub fn new(run_id: Uuid, seed: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            seed,
            rubric: None,
            rubric_critique: None,
            score: None,
            score_critique: None,
            last_error: None,
        }
    }

    pub fn stage_output(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::RubricGen => self.rubric.as_deref(),
            Stage::RubricCritic => self.rubric_critique.as_deref(),
            Stage::ScoreGen => self.score.as_deref(),
            Stage::ScoreCritic => self.score_critique.as_deref(),
            _ => None,
        }
    }

    pub fn set_stage_output(&mut self, stage: Stage, output: String) {
        match stage {
            Stage::RubricGen => self.rubric = Some(output),
            Stage::RubricCritic => self.rubric_critique = Some(output),
            Stage::ScoreGen => self.score = Some(output),
            Stage::ScoreCritic => self.score_critique = Some(output),
            _ => {}
        }
    }
}

/// Storage for windows and their evidence.
#[async_trait]
pub trait EvidenceRepository: Send + Sync {
    async fn insert_window(&self, window: &Window) -> Result<(), StoreError>;
    async fn get_window(&self, id: Uuid) -> Result<Option<Window>, StoreError>;
    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError>;
    async fn get_evidence(&self, id: Uuid) -> Result<Option<Evidence>, StoreError>;
    async fn list_evidence(&self, window_id: Uuid) -> Result<Vec<Evidence>, StoreError>;
    async fn put_evidence(&self, evidence: &Evidence) -> Result<(), StoreError>;
}

/// Storage for experiments, runs and samples.
#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;
    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError>;
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError>;
    async fn insert_sample(&self, sample: &Sample) -> Result<(), StoreError>;
    async fn get_sample(&self, id: Uuid) -> Result<Option<Sample>, StoreError>;
    async fn list_samples(&self, run_id: Uuid) -> Result<Vec<Sample>, StoreError>;
    async fn put_sample(&self, sample: &Sample) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_stage_chain() {
        let mut evidence = Evidence::new(Uuid::new_v4(), "raw text");
        assert_eq!(evidence.stage_input(Stage::EvidenceClean), Some("raw text"));
        assert_eq!(evidence.stage_input(Stage::EvidenceNeutralize), None);

        evidence.set_stage_output(Stage::EvidenceClean, "clean".to_string());
        assert_eq!(evidence.stage_output(Stage::EvidenceClean), Some("clean"));
        assert_eq!(evidence.stage_input(Stage::EvidenceNeutralize), Some("clean"));
        assert_eq!(evidence.content(EvidenceView::Cleaned), Some("clean"));
        assert_eq!(evidence.content(EvidenceView::Abstracted), None);
    }

    #[test]
    fn test_sample_outputs() {
        let mut sample = Sample::new(Uuid::new_v4(), 3);
        assert!(sample.stage_output(Stage::RubricGen).is_none());
        sample.set_stage_output(Stage::RubricGen, "rubric".to_string());
        assert_eq!(sample.rubric.as_deref(), Some("rubric"));
        // foreign stages are ignored
        sample.set_stage_output(Stage::EvidenceClean, "x".to_string());
        assert!(sample.stage_output(Stage::EvidenceClean).is_none());
    }

    #[test]
    fn test_evidence_view_parse() {
        assert_eq!("neutralized".parse::<EvidenceView>(), Ok(EvidenceView::Neutralized));
        assert!("l3".parse::<EvidenceView>().is_err());
    }
}
