//! Shared fixtures: an in-memory engine with scripted providers.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use eval_forge::engine::{EngineContext, ProcessLifecycle};
use eval_forge::llm::{
    BatchClient, BatchItem, BatchItemResult, BatchPoll, ChatClient, ChatRequest, ChatResponse,
};
use eval_forge::models::{Process, ProcessKind, Stage};
use eval_forge::pipeline::{standard_registry, Evidence, EvidenceRepository, Window};
use eval_forge::policy::RunPolicy;
use eval_forge::storage::MemoryStore;
use eval_forge::LlmError;

/// Marker text that makes the scripted providers fail an item.
pub const FAIL_MARKER: &str = "FAILME";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

/// Small, fast policy: three targets go to a batch on batchable models.
pub fn test_policy() -> RunPolicy {
    RunPolicy {
        poll_interval_ms: 1000,
        min_batch_size: 2,
        job_fallback_count: 1,
        max_request_attempts: 2,
        max_batch_retries: 1,
        retry_backoff_ms: 1000,
        ..RunPolicy::default()
    }
}

/// Chat provider echoing the input, failing prompts that contain a marker.
#[derive(Default)]
pub struct ScriptedChat {
    calls: AtomicUsize,
    failing: Mutex<Vec<String>>,
    blank: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn fail_when(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    /// Answers prompts containing `needle` with blank output.
    pub fn blank_when(&self, needle: &str) {
        self.blank.lock().unwrap().push(needle.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|n| request.user.contains(n.as_str()))
        {
            return Err(LlmError::ApiError {
                code: 500,
                message: "scripted failure".to_string(),
            });
        }
        let blank = self
            .blank
            .lock()
            .unwrap()
            .iter()
            .any(|n| request.user.contains(n.as_str()));
        let text = if blank {
            "  ".to_string()
        } else {
            format!("{} [{}]", request.user, request.model)
        };
        Ok(ChatResponse {
            text,
            input_tokens: Some(10),
            output_tokens: Some(5),
        })
    }
}

/// What the scripted batch provider answers to polls.
#[derive(Debug, Clone, PartialEq)]
pub enum PollMode {
    Complete,
    Running,
    Error(String),
}

/// Batch provider keeping submitted items in memory.
pub struct ScriptedBatch {
    submitted: Mutex<HashMap<String, Vec<BatchItem>>>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    mode: Mutex<PollMode>,
    submit_error: Mutex<Option<String>>,
    failing: Mutex<Vec<String>>,
    /// Custom ids left out of completed results.
    dropped: Mutex<Vec<String>>,
}

impl Default for ScriptedBatch {
    fn default() -> Self {
        Self {
            submitted: Mutex::new(HashMap::new()),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            mode: Mutex::new(PollMode::Complete),
            submit_error: Mutex::new(None),
            failing: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedBatch {
    pub fn set_mode(&self, mode: PollMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_submit_error(&self, error: Option<&str>) {
        *self.submit_error.lock().unwrap() = error.map(str::to_string);
    }

    pub fn fail_when(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    pub fn drop_result(&self, custom_id: String) {
        self.dropped.lock().unwrap().push(custom_id);
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Items of the most recent submission under `batch_ref`.
    pub fn items(&self, batch_ref: &str) -> Vec<BatchItem> {
        self.submitted
            .lock()
            .unwrap()
            .get(batch_ref)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BatchClient for ScriptedBatch {
    async fn submit(&self, _model: &str, items: Vec<BatchItem>) -> Result<String, LlmError> {
        if let Some(error) = self.submit_error.lock().unwrap().clone() {
            return Err(LlmError::Batch(error));
        }
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        let batch_ref = format!("batch_{}", n);
        self.submitted
            .lock()
            .unwrap()
            .insert(batch_ref.clone(), items);
        Ok(batch_ref)
    }

    async fn poll(&self, batch_ref: &str) -> Result<BatchPoll, LlmError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            PollMode::Running => Ok(BatchPoll::Running),
            PollMode::Error(reason) => Ok(BatchPoll::Error(reason)),
            PollMode::Complete => {
                let failing = self.failing.lock().unwrap().clone();
                let dropped = self.dropped.lock().unwrap().clone();
                let results = self
                    .items(batch_ref)
                    .into_iter()
                    .filter(|item| !dropped.contains(&item.custom_id))
                    .map(|item| {
                        if failing.iter().any(|n| item.request.user.contains(n.as_str())) {
                            BatchItemResult::failed(item.custom_id, "scripted item failure")
                        } else {
                            let output = format!("{} [batch]", item.request.user);
                            BatchItemResult::completed(item.custom_id, output)
                        }
                    })
                    .collect();
                Ok(BatchPoll::Completed(results))
            }
        }
    }
}

/// An engine over a fresh [`MemoryStore`] with scripted providers.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chat: Arc<ScriptedChat>,
    pub batch: Arc<ScriptedBatch>,
    pub ctx: Arc<EngineContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_context(|_, ctx| ctx)
    }

    /// Like [`Harness::new`], letting the test swap strategies or the limiter.
    pub fn with_context(
        configure: impl FnOnce(&Arc<MemoryStore>, EngineContext) -> EngineContext,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let chat = Arc::new(ScriptedChat::default());
        let batch = Arc::new(ScriptedBatch::default());
        let registry = standard_registry(store.clone(), store.clone());
        let ctx = EngineContext::new(store.clone(), registry, chat.clone(), batch.clone());
        let ctx = Arc::new(configure(&store, ctx));
        Self {
            store,
            chat,
            batch,
            ctx,
        }
    }

    pub fn lifecycle(&self) -> ProcessLifecycle {
        ProcessLifecycle::new(self.ctx.clone())
    }

    /// Inserts a window on `model` with one evidence row per text.
    pub async fn window(&self, model: &str, texts: &[&str]) -> (Uuid, Vec<Uuid>) {
        let window = Window {
            id: Uuid::new_v4(),
            model: model.to_string(),
        };
        self.store.insert_window(&window).await.unwrap();
        let mut ids = Vec::new();
        for text in texts {
            let evidence = Evidence::new(window.id, *text);
            ids.push(evidence.id);
            self.store.insert_evidence(&evidence).await.unwrap();
        }
        (window.id, ids)
    }

    /// Creates and starts a window process at `t0`.
    pub async fn started_window(
        &self,
        model: &str,
        texts: &[&str],
        policy: RunPolicy,
    ) -> (Process, Vec<Uuid>) {
        let (window_id, ids) = self.window(model, texts).await;
        self.lifecycle()
            .create_process(ProcessKind::Window, window_id, policy, None, t0())
            .await
            .unwrap();
        self.lifecycle().start(window_id, t0()).await.unwrap();
        (self.process(window_id).await, ids)
    }

    pub async fn process(&self, id: Uuid) -> Process {
        use eval_forge::storage::Store;
        self.store.get_process(id).await.unwrap().unwrap()
    }

    pub async fn evidence(&self, id: Uuid) -> Evidence {
        self.store.get_evidence(id).await.unwrap().unwrap()
    }

    pub async fn stage(&self, id: Uuid) -> Stage {
        self.process(id).await.current_stage
    }
}
