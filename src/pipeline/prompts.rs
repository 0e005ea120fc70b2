//! Prompt builders for every pipeline stage.
//!
//! Each stage has a fixed system prompt; the user prompt carries the stage
//! input verbatim.

use crate::models::Stage;

/// System and user messages for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPair {
    pub system: Option<String>,
    pub user: String,
}

impl PromptPair {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            user: user.into(),
        }
    }
}

const EVIDENCE_CLEAN_SYSTEM: &str = r#"You clean raw evidence documents.

Remove navigation text, boilerplate, advertisements and formatting debris.
Keep every factual statement exactly as written. Return only the cleaned text."#;

const EVIDENCE_NEUTRALIZE_SYSTEM: &str = r#"You neutralize evidence documents.

Rewrite the text so that loaded, emotive or partisan wording is replaced with
neutral language. Do not add, remove or reorder facts. Return only the
rewritten text."#;

const EVIDENCE_ABSTRACT_SYSTEM: &str = r#"You abstract evidence documents.

Replace names of people, organizations and places with generic role
descriptions so the text can be judged without identifying its source.
Return only the abstracted text."#;

const RUBRIC_GEN_SYSTEM: &str = r#"You design grading rubrics.

The input is a JSON object with a `concept` and a `scale_size`. Produce a
rubric with exactly `scale_size` ordered levels describing how strongly a
piece of evidence expresses the concept. Respond with JSON:
{"levels": [{"score": 1, "description": "..."}]}"#;

const RUBRIC_CRITIC_SYSTEM: &str = r#"You review grading rubrics.

The input is a JSON object with a `concept` and a `rubric`. Point out levels
that overlap, are ambiguous or do not match the concept. Respond with JSON:
{"verdict": "accept" | "revise", "issues": ["..."]}"#;

const SCORE_GEN_SYSTEM: &str = r#"You score evidence against a rubric.

The input is a JSON object with a `concept`, a `rubric` and an `evidence`
text. Pick the single rubric level that best fits the evidence. Respond with
JSON: {"score": <level>, "reasoning": "..."}"#;

const SCORE_CRITIC_SYSTEM: &str = r#"You audit evidence scores.

The input is a JSON object with a `rubric`, an `evidence` text and a
`score`. Decide whether the score is justified by the rubric. Respond with
JSON: {"verdict": "agree" | "disagree", "expected_score": <level>, "reasoning": "..."}"#;

pub fn system_prompt(stage: Stage) -> &'static str {
    match stage {
        Stage::EvidenceClean => EVIDENCE_CLEAN_SYSTEM,
        Stage::EvidenceNeutralize => EVIDENCE_NEUTRALIZE_SYSTEM,
        Stage::EvidenceAbstract => EVIDENCE_ABSTRACT_SYSTEM,
        Stage::RubricGen => RUBRIC_GEN_SYSTEM,
        Stage::RubricCritic => RUBRIC_CRITIC_SYSTEM,
        Stage::ScoreGen => SCORE_GEN_SYSTEM,
        Stage::ScoreCritic => SCORE_CRITIC_SYSTEM,
    }
}

/// Builds the prompt pair for a stage input.
pub fn build_stage_prompt(stage: Stage, input: &str) -> PromptPair {
    PromptPair::new(system_prompt(stage), input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessKind;

    #[test]
    fn test_every_stage_has_a_system_prompt() {
        for kind in ProcessKind::ALL {
            for stage in kind.stage_order() {
                assert!(!system_prompt(*stage).is_empty());
            }
        }
    }

    #[test]
    fn test_user_prompt_is_input() {
        let prompt = build_stage_prompt(Stage::EvidenceClean, "raw evidence");
        assert_eq!(prompt.user, "raw evidence");
        assert!(prompt.system.unwrap().contains("clean"));
    }
}
