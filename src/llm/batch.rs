//! Asynchronous batch submission and polling.
//!
//! Items are correlated with their results through `custom_id`, which is the
//! encoded request key.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use super::chat::{build_http_client, error_for_status, ApiRequest, ApiResponse, ChatRequest};
use super::chat::DEFAULT_API_BASE;
use crate::error::LlmError;

const CHAT_ENDPOINT: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";

/// One item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub custom_id: String,
    pub request: ChatRequest,
}

/// Per-item result of a finished batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed {
        output: String,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    pub custom_id: String,
    pub outcome: ItemOutcome,
}

impl BatchItemResult {
    pub fn completed(custom_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            outcome: ItemOutcome::Completed {
                output: output.into(),
                input_tokens: None,
                output_tokens: None,
            },
        }
    }

    pub fn failed(custom_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            outcome: ItemOutcome::Failed {
                error: error.into(),
            },
        }
    }
}

/// What the provider reports for a submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPoll {
    Running,
    Error(String),
    Completed(Vec<BatchItemResult>),
}

/// Provider batch API.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submits items and returns the provider-side batch reference.
    async fn submit(&self, model: &str, items: Vec<BatchItem>) -> Result<String, LlmError>;

    async fn poll(&self, batch_ref: &str) -> Result<BatchPoll, LlmError>;
}

/// Client for the OpenAI files and batches endpoints.
pub struct OpenAiBatchClient {
    api_base: String,
    api_key: String,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct JsonlLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'static str,
    body: ApiRequest,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateBatch<'a> {
    input_file_id: &'a str,
    endpoint: &'static str,
    completion_window: &'static str,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    errors: Option<BatchErrors>,
}

#[derive(Debug, Deserialize)]
struct BatchErrors {
    #[serde(default)]
    data: Vec<BatchErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct BatchErrorEntry {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<OutputError>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    status_code: u16,
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OutputError {
    #[serde(default)]
    message: Option<String>,
}

impl OpenAiBatchClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Result<Self, LlmError> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http_client: build_http_client(Duration::from_secs(300))?,
        })
    }

    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| LlmError::MissingApiKey)?;
        let api_base = env::var("OPENAI_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        Self::new(api_base, api_key)
    }

    async fn upload(&self, jsonl: String) -> Result<String, LlmError> {
        let part = Part::bytes(jsonl.into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let response = self
            .http_client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let file: FileObject = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(file.id)
    }

    async fn download(&self, file_id: &str) -> Result<String, LlmError> {
        let response = self
            .http_client
            .get(format!("{}/files/{}/content", self.api_base, file_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        error_for_status(response)
            .await?
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))
    }
}

/// Renders items as the JSONL input file.
fn encode_jsonl(model: &str, items: &[BatchItem]) -> Result<String, LlmError> {
    let mut out = String::new();
    for item in items {
        let mut body = ApiRequest::from(&item.request);
        body.model = model.to_string();
        let line = JsonlLine {
            custom_id: &item.custom_id,
            method: "POST",
            url: CHAT_ENDPOINT,
            body,
        };
        let encoded = serde_json::to_string(&line)
            .map_err(|e| LlmError::Batch(format!("Failed to encode batch line: {}", e)))?;
        out.push_str(&encoded);
        out.push('\n');
    }
    Ok(out)
}

/// Parses output or error file lines into per-item results.
fn parse_output_lines(raw: &str) -> Result<Vec<BatchItemResult>, LlmError> {
    let mut results = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: OutputLine = serde_json::from_str(line)
            .map_err(|e| LlmError::ParseError(format!("Bad batch output line: {}", e)))?;

        let outcome = match (parsed.response, parsed.error) {
            (_, Some(err)) => ItemOutcome::Failed {
                error: err.message.unwrap_or_else(|| "provider_error".to_string()),
            },
            (Some(resp), None) if (200..300).contains(&resp.status_code) => {
                match serde_json::from_value::<ApiResponse>(resp.body)
                    .map_err(|e| LlmError::ParseError(e.to_string()))
                    .and_then(ApiResponse::into_chat_response)
                {
                    Ok(chat) => ItemOutcome::Completed {
                        output: chat.text,
                        input_tokens: chat.input_tokens,
                        output_tokens: chat.output_tokens,
                    },
                    Err(e) => ItemOutcome::Failed {
                        error: e.to_string(),
                    },
                }
            }
            (Some(resp), None) => ItemOutcome::Failed {
                error: format!("status {}", resp.status_code),
            },
            (None, None) => ItemOutcome::Failed {
                error: "provider_error".to_string(),
            },
        };
        results.push(BatchItemResult {
            custom_id: parsed.custom_id,
            outcome,
        });
    }
    Ok(results)
}

#[async_trait]
impl BatchClient for OpenAiBatchClient {
    async fn submit(&self, model: &str, items: Vec<BatchItem>) -> Result<String, LlmError> {
        if items.is_empty() {
            return Err(LlmError::Batch("refusing to submit an empty batch".to_string()));
        }
        let jsonl = encode_jsonl(model, &items)?;
        let input_file_id = self.upload(jsonl).await?;

        let response = self
            .http_client
            .post(format!("{}/batches", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&CreateBatch {
                input_file_id: &input_file_id,
                endpoint: CHAT_ENDPOINT,
                completion_window: COMPLETION_WINDOW,
            })
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let batch: BatchObject = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        tracing::info!(batch_ref = %batch.id, model, items = items.len(), "Submitted provider batch");
        Ok(batch.id)
    }

    async fn poll(&self, batch_ref: &str) -> Result<BatchPoll, LlmError> {
        let response = self
            .http_client
            .get(format!("{}/batches/{}", self.api_base, batch_ref))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let batch: BatchObject = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        match batch.status.as_str() {
            "validating" | "in_progress" | "finalizing" => Ok(BatchPoll::Running),
            "completed" => {
                let mut results = Vec::new();
                if let Some(file_id) = batch.output_file_id.as_deref() {
                    results.extend(parse_output_lines(&self.download(file_id).await?)?);
                }
                if let Some(file_id) = batch.error_file_id.as_deref() {
                    results.extend(parse_output_lines(&self.download(file_id).await?)?);
                }
                Ok(BatchPoll::Completed(results))
            }
            other => {
                let reason = batch
                    .errors
                    .and_then(|e| e.data.into_iter().find_map(|d| d.message))
                    .unwrap_or_else(|| other.to_string());
                Ok(BatchPoll::Error(reason))
            }
        }
    }
}

/// Maps results by `custom_id`, keeping the first result per id.
pub fn index_results(results: Vec<BatchItemResult>) -> HashMap<String, BatchItemResult> {
    let mut map = HashMap::with_capacity(results.len());
    for result in results {
        map.entry(result.custom_id.clone()).or_insert(result);
    }
    map
}
