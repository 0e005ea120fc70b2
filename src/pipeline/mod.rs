//! Pipeline kinds and their domain logic.
//!
//! The engine is generic over process kinds; everything that knows about
//! evidence rows or samples lives here behind [`StageStrategy`].
//!
//! - [`evidence`]: `window` processes (clean → neutralize → abstract)
//! - [`experiment`]: `run` processes (rubric_gen → rubric_critic → score_gen → score_critic)
//!
//! # Example
//!
//! ```rust,ignore
//! use eval_forge::pipeline::{EvidencePipeline, ExperimentPipeline, PipelineRegistry};
//! use std::sync::Arc;
//!
//! let registry = PipelineRegistry::new()
//!     .with_strategy(Arc::new(EvidencePipeline::new(store.clone())))
//!     .with_strategy(Arc::new(ExperimentPipeline::new(store.clone(), store.clone())));
//! ```

pub mod domain;
pub mod evidence;
pub mod experiment;
pub mod prompts;
pub mod strategy;

use std::sync::Arc;

pub use domain::{
    Evidence, EvidenceRepository, EvidenceView, Experiment, ExperimentRepository, Run, Sample,
    Window,
};
pub use evidence::EvidencePipeline;
pub use experiment::ExperimentPipeline;
pub use prompts::{build_stage_prompt, PromptPair};
pub use strategy::{parse_output, PipelineRegistry, StageStrategy, StageTarget};

/// Registry with both built-in pipelines.
pub fn standard_registry(
    evidence: Arc<dyn EvidenceRepository>,
    experiments: Arc<dyn ExperimentRepository>,
) -> PipelineRegistry {
    PipelineRegistry::new()
        .with_strategy(Arc::new(EvidencePipeline::new(evidence.clone())))
        .with_strategy(Arc::new(ExperimentPipeline::new(experiments, evidence)))
}
