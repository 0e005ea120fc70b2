//! Known models, their providers and whether they accept batch submissions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// LLM provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Openai,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::Openai),
            other => Err(other.to_string()),
        }
    }
}

/// Static description of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: &'static str,
    pub provider: Provider,
    /// Whether the provider exposes an asynchronous bulk API for this model.
    pub batchable: bool,
}

const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "gpt-4.1",
        provider: Provider::Openai,
        batchable: true,
    },
    ModelSpec {
        id: "gpt-4.1-mini",
        provider: Provider::Openai,
        batchable: true,
    },
    ModelSpec {
        id: "gpt-5.2",
        provider: Provider::Openai,
        batchable: true,
    },
    ModelSpec {
        id: "gpt-5.2-chat",
        provider: Provider::Openai,
        batchable: false,
    },
];

/// All built-in models.
pub fn all_models() -> &'static [ModelSpec] {
    MODELS
}

/// Looks up a model by id.
pub fn model_spec(model: &str) -> Result<ModelSpec, EngineError> {
    MODELS
        .iter()
        .find(|m| m.id == model)
        .copied()
        .ok_or_else(|| EngineError::UnknownModel(model.to_string()))
}

pub fn is_batchable(model: &str) -> bool {
    model_spec(model).map(|m| m.batchable).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lookup() {
        let spec = model_spec("gpt-4.1-mini").unwrap();
        assert_eq!(spec.provider, Provider::Openai);
        assert!(spec.batchable);

        let spec = model_spec("gpt-5.2-chat").unwrap();
        assert_eq!(spec.provider, Provider::Openai);
        assert!(!spec.batchable);
    }

    #[test]
    fn test_every_model_has_a_wired_provider() {
        assert!(all_models().iter().all(|m| m.provider == Provider::Openai));
        assert!(matches!(
            model_spec("claude-haiku-4.5"),
            Err(EngineError::UnknownModel(_))
        ));
        assert!("anthropic".parse::<Provider>().is_err());
        assert_eq!("openai".parse::<Provider>(), Ok(Provider::Openai));
    }

    #[test]
    fn test_unknown_model() {
        assert!(matches!(
            model_spec("gpt-2"),
            Err(EngineError::UnknownModel(_))
        ));
        assert!(!is_batchable("gpt-2"));
        assert!(!is_batchable("gpt-5.2-chat"));
    }
}
