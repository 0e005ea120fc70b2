//! Error types for eval-forge operations.
//!
//! Defines the error taxonomy shared by the engine subsystems:
//! - Idempotency key decoding
//! - Persistent store access
//! - Policy resolution and loading
//! - LLM provider interactions (chat and batch)
//! - Orchestration (structural failures vs. transient ones)

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while decoding request and process keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Malformed key '{0}'")]
    Malformed(String),

    #[error("Unknown process kind '{kind}' in key '{key}'")]
    UnknownKind { kind: String, key: String },

    #[error("Unknown stage '{stage}' in key '{key}'")]
    UnknownStage { stage: String, key: String },

    #[error("Invalid id '{id}' in key '{key}'")]
    InvalidId { id: String, key: String },
}

/// Errors that can occur while reading or writing engine state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// Errors that can occur while resolving or loading run policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid policy: {0}")]
    Invalid(String),

    #[error("Failed to parse policy YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM provider interactions.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENAI_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
}

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("No pipeline registered for process kind '{0}'")]
    UnregisteredKind(String),

    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Stage '{stage}' is not part of the {kind} pipeline")]
    StageNotInPipeline { kind: String, stage: String },

    #[error("Failed to parse stage output: {0}")]
    ParseFailure(String),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Structural errors cannot be fixed by retrying; the owning entity is
    /// marked `error` immediately.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EngineError::ProcessNotFound(_)
                | EngineError::UnregisteredKind(_)
                | EngineError::UnknownModel(_)
                | EngineError::StageNotInPipeline { .. }
                | EngineError::ParseFailure(_)
                | EngineError::Structural(_)
                | EngineError::Key(_)
                | EngineError::Policy(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_display() {
        let err = KeyError::UnknownKind {
            kind: "sample".to_string(),
            key: "sample:1:rubric_gen".to_string(),
        };
        assert!(err.to_string().contains("sample"));
    }

    #[test]
    fn test_structural_classification() {
        assert!(EngineError::ProcessNotFound(Uuid::nil()).is_structural());
        assert!(EngineError::Key(KeyError::Malformed("x".into())).is_structural());
        assert!(!EngineError::Llm(LlmError::RateLimited("slow down".into())).is_structural());
        assert!(!EngineError::Store(StoreError::NotFound("row".into())).is_structural());
    }
}
