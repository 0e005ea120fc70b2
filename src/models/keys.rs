//! Idempotency keys that address work by (process kind, process, target, stage).
//!
//! A [`RequestKey`] identifies one unit of work and is stored on every LLM
//! request; a [`ProcessKey`] identifies the (process, stage) pair that owns a
//! job or batch. Both render to colon-delimited strings for storage and for
//! provider-side correlation (`custom_id`), and parse back losslessly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::KeyError;

/// The family of pipeline a process instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Evidence processing over the rows of a window.
    Window,
    /// Experiment run over the samples of a run.
    Run,
}

const WINDOW_STAGES: [Stage; 3] = [
    Stage::EvidenceClean,
    Stage::EvidenceNeutralize,
    Stage::EvidenceAbstract,
];

const RUN_STAGES: [Stage; 4] = [
    Stage::RubricGen,
    Stage::RubricCritic,
    Stage::ScoreGen,
    Stage::ScoreCritic,
];

impl ProcessKind {
    pub const ALL: [ProcessKind; 2] = [ProcessKind::Window, ProcessKind::Run];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Window => "window",
            ProcessKind::Run => "run",
        }
    }

    /// Fixed linear stage order of this pipeline kind.
    pub fn stage_order(&self) -> &'static [Stage] {
        match self {
            ProcessKind::Window => &WINDOW_STAGES,
            ProcessKind::Run => &RUN_STAGES,
        }
    }

    pub fn first_stage(&self) -> Stage {
        self.stage_order()[0]
    }

    pub fn stage_index(&self, stage: Stage) -> Option<usize> {
        self.stage_order().iter().position(|s| *s == stage)
    }

    /// The stage following `stage`, or `None` for the last one.
    pub fn next_stage(&self, stage: Stage) -> Option<Stage> {
        let idx = self.stage_index(stage)?;
        self.stage_order().get(idx + 1).copied()
    }

    pub fn is_last_stage(&self, stage: Stage) -> bool {
        self.stage_order().last() == Some(&stage)
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "window" => Ok(ProcessKind::Window),
            "run" => Ok(ProcessKind::Run),
            other => Err(other.to_string()),
        }
    }
}

/// One step of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EvidenceClean,
    EvidenceNeutralize,
    EvidenceAbstract,
    RubricGen,
    RubricCritic,
    ScoreGen,
    ScoreCritic,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::EvidenceClean => "evidence_clean",
            Stage::EvidenceNeutralize => "evidence_neutralize",
            Stage::EvidenceAbstract => "evidence_abstract",
            Stage::RubricGen => "rubric_gen",
            Stage::RubricCritic => "rubric_critic",
            Stage::ScoreGen => "score_gen",
            Stage::ScoreCritic => "score_critic",
        }
    }

    /// The pipeline kind this stage belongs to.
    pub fn kind(&self) -> ProcessKind {
        match self {
            Stage::EvidenceClean | Stage::EvidenceNeutralize | Stage::EvidenceAbstract => {
                ProcessKind::Window
            }
            _ => ProcessKind::Run,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evidence_clean" => Ok(Stage::EvidenceClean),
            "evidence_neutralize" => Ok(Stage::EvidenceNeutralize),
            "evidence_abstract" => Ok(Stage::EvidenceAbstract),
            "rubric_gen" => Ok(Stage::RubricGen),
            "rubric_critic" => Ok(Stage::RubricCritic),
            "score_gen" => Ok(Stage::ScoreGen),
            "score_critic" => Ok(Stage::ScoreCritic),
            other => Err(other.to_string()),
        }
    }
}

/// Address of one unit of work: `kind:process_id:target_id:stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub kind: ProcessKind,
    pub process_id: Uuid,
    pub target_id: Uuid,
    pub stage: Stage,
}

impl RequestKey {
    pub fn new(kind: ProcessKind, process_id: Uuid, target_id: Uuid, stage: Stage) -> Self {
        Self {
            kind,
            process_id,
            target_id,
            stage,
        }
    }

    /// The (process, stage) key that owns this request.
    pub fn process_key(&self) -> ProcessKey {
        ProcessKey::new(self.kind, self.process_id, self.stage)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split(':').collect();
        let [kind, process_id, target_id, stage] = parts.as_slice() else {
            return Err(KeyError::Malformed(key.to_string()));
        };
        let kind = parse_kind(kind, key)?;
        let stage = parse_stage(kind, stage, key)?;
        Ok(Self {
            kind,
            process_id: parse_id(process_id, key)?,
            target_id: parse_id(target_id, key)?,
            stage,
        })
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind, self.process_id, self.target_id, self.stage
        )
    }
}

impl FromStr for RequestKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Address of the (process, stage) pair that owns a job or a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub kind: ProcessKind,
    pub process_id: Uuid,
    pub stage: Stage,
}

impl ProcessKey {
    pub fn new(kind: ProcessKind, process_id: Uuid, stage: Stage) -> Self {
        Self {
            kind,
            process_id,
            stage,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split(':').collect();
        let [kind, process_id, stage] = parts.as_slice() else {
            return Err(KeyError::Malformed(key.to_string()));
        };
        let kind = parse_kind(kind, key)?;
        let stage = parse_stage(kind, stage, key)?;
        Ok(Self {
            kind,
            process_id: parse_id(process_id, key)?,
            stage,
        })
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.process_id, self.stage)
    }
}

impl FromStr for ProcessKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

fn parse_kind(raw: &str, key: &str) -> Result<ProcessKind, KeyError> {
    raw.parse().map_err(|kind| KeyError::UnknownKind {
        kind,
        key: key.to_string(),
    })
}

fn parse_stage(kind: ProcessKind, raw: &str, key: &str) -> Result<Stage, KeyError> {
    let stage: Stage = raw.parse().map_err(|stage| KeyError::UnknownStage {
        stage,
        key: key.to_string(),
    })?;
    // A stage from another pipeline would misroute the callback.
    if stage.kind() != kind {
        return Err(KeyError::UnknownStage {
            stage: raw.to_string(),
            key: key.to_string(),
        });
    }
    Ok(stage)
}

fn parse_id(raw: &str, key: &str) -> Result<Uuid, KeyError> {
    Uuid::parse_str(raw).map_err(|_| KeyError::InvalidId {
        id: raw.to_string(),
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_decode_inverts_encode() {
        let key = RequestKey::new(
            ProcessKind::Run,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Stage::ScoreCritic,
        );
        let encoded = key.encode();
        assert!(encoded.starts_with("run:"));
        assert!(encoded.ends_with(":score_critic"));
        assert_eq!(RequestKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_process_key_from_request_key() {
        let pid = Uuid::new_v4();
        let key = RequestKey::new(ProcessKind::Window, pid, Uuid::new_v4(), Stage::EvidenceClean);
        let process_key = key.process_key();
        assert_eq!(process_key.process_id, pid);
        assert_eq!(
            ProcessKey::decode(&process_key.encode()).unwrap(),
            process_key
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        let raw = format!("sample:{}:{}:rubric_gen", Uuid::nil(), Uuid::nil());
        let err = RequestKey::decode(&raw).unwrap_err();
        assert!(matches!(err, KeyError::UnknownKind { ref kind, .. } if kind == "sample"));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            RequestKey::decode("window:abc"),
            Err(KeyError::Malformed(_))
        ));
        assert!(matches!(
            ProcessKey::decode("window:a:b:c"),
            Err(KeyError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_foreign_stage() {
        let raw = format!("window:{}:{}:rubric_gen", Uuid::nil(), Uuid::nil());
        assert!(matches!(
            RequestKey::decode(&raw),
            Err(KeyError::UnknownStage { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_id() {
        let raw = format!("run:not-a-uuid:{}:rubric_gen", Uuid::nil());
        assert!(matches!(
            RequestKey::decode(&raw),
            Err(KeyError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_stage_order() {
        let kind = ProcessKind::Run;
        assert_eq!(kind.first_stage(), Stage::RubricGen);
        assert_eq!(kind.next_stage(Stage::RubricGen), Some(Stage::RubricCritic));
        assert_eq!(kind.next_stage(Stage::ScoreCritic), None);
        assert!(kind.is_last_stage(Stage::ScoreCritic));
        assert_eq!(ProcessKind::Window.next_stage(Stage::RubricGen), None);
    }
}
