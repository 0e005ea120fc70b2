//! In-memory store used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::error::StoreError;
use crate::models::{
    BatchStatus, JobStatus, LlmBatch, LlmJob, LlmRequest, Process, ProcessKind, ProcessPatch,
    ProcessStatus, RequestKey, Route, SchedulerState, Stage,
};
use crate::pipeline::domain::{
    Evidence, EvidenceRepository, Experiment, ExperimentRepository, Run, Sample, Window,
};

/// Rows keyed by id; lists come back in insertion order.
#[derive(Debug)]
struct Table<T> {
    rows: HashMap<Uuid, (u64, T)>,
    next_seq: u64,
}

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, id: Uuid, row: T, what: &str) -> Result<(), StoreError> {
        if self.rows.contains_key(&id) {
            return Err(StoreError::Duplicate(format!("{} {}", what, id)));
        }
        self.rows.insert(id, (self.next_seq, row));
        self.next_seq += 1;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Option<T> {
        self.rows.get(&id).map(|(_, row)| row.clone())
    }

    fn put(&mut self, id: Uuid, row: T, what: &str) -> Result<(), StoreError> {
        match self.rows.get_mut(&id) {
            Some(slot) => {
                slot.1 = row;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("{} {}", what, id))),
        }
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut T> {
        self.rows.get_mut(&id).map(|(_, row)| row)
    }

    fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let mut matched: Vec<&(u64, T)> = self.rows.values().filter(|(_, r)| pred(r)).collect();
        matched.sort_by_key(|(seq, _)| *seq);
        matched.into_iter().map(|(_, r)| r.clone()).collect()
    }
}

struct Inner {
    requests: Table<LlmRequest>,
    jobs: Table<LlmJob>,
    batches: Table<LlmBatch>,
    processes: Table<Process>,
    scheduler: SchedulerState,
    windows: Table<Window>,
    evidence: Table<Evidence>,
    experiments: Table<Experiment>,
    runs: Table<Run>,
    samples: Table<Sample>,
}

/// Store backed by in-process hash maps.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                requests: Table::new(),
                jobs: Table::new(),
                batches: Table::new(),
                processes: Table::new(),
                scheduler: SchedulerState::default(),
                windows: Table::new(),
                evidence: Table::new(),
                experiments: Table::new(),
                runs: Table::new(),
                samples: Table::new(),
            }),
        }
    }

    /// All requests, in creation order.
    pub async fn all_requests(&self) -> Vec<LlmRequest> {
        self.inner.read().await.requests.filter(|_| true)
    }

    pub async fn all_jobs(&self) -> Vec<LlmJob> {
        self.inner.read().await.jobs.filter(|_| true)
    }

    pub async fn all_batches(&self) -> Vec<LlmBatch> {
        self.inner.read().await.batches.filter(|_| true)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_request(&self, request: &LlmRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.requests.insert(request.id, request.clone(), "request")
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<LlmRequest>, StoreError> {
        Ok(self.inner.read().await.requests.get(id))
    }

    async fn put_request(&self, request: &LlmRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.requests.put(request.id, request.clone(), "request")
    }

    async fn list_requests_by_key(&self, key: &RequestKey) -> Result<Vec<LlmRequest>, StoreError> {
        Ok(self.inner.read().await.requests.filter(|r| r.key == *key))
    }

    async fn list_requests_by_route(&self, route: Route) -> Result<Vec<LlmRequest>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .requests
            .filter(|r| r.route == Some(route)))
    }

    async fn list_requests_by_process(
        &self,
        kind: ProcessKind,
        process_id: Uuid,
    ) -> Result<Vec<LlmRequest>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .requests
            .filter(|r| r.key.kind == kind && r.key.process_id == process_id))
    }

    async fn insert_job(&self, job: &LlmJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone(), "job")
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<LlmJob>, StoreError> {
        Ok(self.inner.read().await.jobs.get(id))
    }

    async fn put_job(&self, job: &LlmJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.jobs.put(job.id, job.clone(), "job")
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<LlmJob>, StoreError> {
        Ok(self.inner.read().await.jobs.filter(|j| j.status == status))
    }

    async fn insert_batch(&self, batch: &LlmBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.batches.insert(batch.id, batch.clone(), "batch")
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<LlmBatch>, StoreError> {
        Ok(self.inner.read().await.batches.get(id))
    }

    async fn put_batch(&self, batch: &LlmBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.batches.put(batch.id, batch.clone(), "batch")
    }

    async fn list_batches_by_status(
        &self,
        status: BatchStatus,
    ) -> Result<Vec<LlmBatch>, StoreError> {
        Ok(self.inner.read().await.batches.filter(|b| b.status == status))
    }

    async fn list_batches_by_process(
        &self,
        kind: ProcessKind,
        process_id: Uuid,
    ) -> Result<Vec<LlmBatch>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .batches
            .filter(|b| b.key.kind == kind && b.key.process_id == process_id))
    }

    async fn try_lock_batch(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let batch = inner
            .batches
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))?;
        if batch.is_locked(now) {
            return Ok(false);
        }
        batch.locked_until = Some(until);
        batch.updated_at = now;
        Ok(true)
    }

    async fn insert_process(&self, process: &Process) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.processes.insert(process.id, process.clone(), "process")
    }

    async fn get_process(&self, id: Uuid) -> Result<Option<Process>, StoreError> {
        Ok(self.inner.read().await.processes.get(id))
    }

    async fn update_process(
        &self,
        id: Uuid,
        from: &[ProcessStatus],
        patch: &ProcessPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let process = inner
            .processes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("process {}", id)))?;
        if !from.contains(&process.status) {
            return Ok(false);
        }
        patch.apply(process, now);
        Ok(true)
    }

    async fn list_processes_by_status(
        &self,
        status: ProcessStatus,
    ) -> Result<Vec<Process>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .processes
            .filter(|p| p.status == status))
    }

    async fn advance_stage(
        &self,
        id: Uuid,
        from: Stage,
        to: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let process = inner
            .processes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("process {}", id)))?;
        if process.current_stage != from || process.status != ProcessStatus::Running {
            return Ok(false);
        }
        process.current_stage = to;
        process.updated_at = now;
        Ok(true)
    }

    async fn get_scheduler_state(&self) -> Result<SchedulerState, StoreError> {
        Ok(self.inner.read().await.scheduler.clone())
    }

    async fn put_scheduler_state(&self, state: &SchedulerState) -> Result<(), StoreError> {
        self.inner.write().await.scheduler = state.clone();
        Ok(())
    }

    async fn try_lock_scheduler(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.scheduler.locked_until.is_some_and(|t| t > now) {
            return Ok(false);
        }
        inner.scheduler.locked_until = Some(until);
        inner.scheduler.next_tick_at = None;
        inner.scheduler.updated_at = Some(now);
        Ok(true)
    }
}

#[async_trait]
impl EvidenceRepository for MemoryStore {
    async fn insert_window(&self, window: &Window) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.windows.insert(window.id, window.clone(), "window")
    }

    async fn get_window(&self, id: Uuid) -> Result<Option<Window>, StoreError> {
        Ok(self.inner.read().await.windows.get(id))
    }

    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.evidence.insert(evidence.id, evidence.clone(), "evidence")
    }

    async fn get_evidence(&self, id: Uuid) -> Result<Option<Evidence>, StoreError> {
        Ok(self.inner.read().await.evidence.get(id))
    }

    async fn list_evidence(&self, window_id: Uuid) -> Result<Vec<Evidence>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .evidence
            .filter(|e| e.window_id == window_id))
    }

    async fn put_evidence(&self, evidence: &Evidence) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.evidence.put(evidence.id, evidence.clone(), "evidence")
    }
}

#[async_trait]
impl ExperimentRepository for MemoryStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .experiments
            .insert(experiment.id, experiment.clone(), "experiment")
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        Ok(self.inner.read().await.experiments.get(id))
    }

    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.id, run.clone(), "run")
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.inner.read().await.runs.get(id))
    }

    async fn insert_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.samples.insert(sample.id, sample.clone(), "sample")
    }

    async fn get_sample(&self, id: Uuid) -> Result<Option<Sample>, StoreError> {
        Ok(self.inner.read().await.samples.get(id))
    }

    async fn list_samples(&self, run_id: Uuid) -> Result<Vec<Sample>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .samples
            .filter(|s| s.run_id == run_id))
    }

    async fn put_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.samples.put(sample.id, sample.clone(), "sample")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provider, RequestStatus};
    use crate::policy::RunPolicy;
    use chrono::Duration;

    fn request(process_id: Uuid, now: DateTime<Utc>) -> LlmRequest {
        let key = RequestKey::new(
            ProcessKind::Window,
            process_id,
            Uuid::new_v4(),
            Stage::EvidenceClean,
        );
        LlmRequest::new(key, "gpt-4.1", Provider::Openai, "prompt", now)
    }

    #[tokio::test]
    async fn test_insert_get_put_request() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut req = request(Uuid::new_v4(), now);
        store.insert_request(&req).await.unwrap();
        assert!(matches!(
            store.insert_request(&req).await,
            Err(StoreError::Duplicate(_))
        ));

        req.status = RequestStatus::Success;
        store.put_request(&req).await.unwrap();
        let loaded = store.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RequestStatus::Success);
    }

    #[tokio::test]
    async fn test_put_missing_is_not_found() {
        let store = MemoryStore::new();
        let req = request(Uuid::new_v4(), Utc::now());
        assert!(matches!(
            store.put_request(&req).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lists_keep_insertion_order() {
        let store = MemoryStore::new();
        let pid = Uuid::new_v4();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let req = request(pid, now);
            ids.push(req.id);
            store.insert_request(&req).await.unwrap();
        }
        let listed: Vec<Uuid> = store
            .list_requests_by_process(ProcessKind::Window, pid)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_batch_lock_excludes_second_holder() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let key = request(Uuid::new_v4(), now).key.process_key();
        let batch = LlmBatch::new(key, "gpt-4.1", Provider::Openai, now);
        store.insert_batch(&batch).await.unwrap();

        let until = now + Duration::seconds(60);
        assert!(store.try_lock_batch(batch.id, now, until).await.unwrap());
        assert!(!store.try_lock_batch(batch.id, now, until).await.unwrap());
        assert!(store
            .try_lock_batch(batch.id, until + Duration::seconds(1), until + Duration::seconds(61))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_advance_stage_compare_and_set() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let process = Process::new(Uuid::new_v4(), ProcessKind::Run, RunPolicy::default(), now);
        store.insert_process(&process).await.unwrap();
        // Only running processes advance.
        assert!(!store
            .advance_stage(process.id, Stage::RubricGen, Stage::RubricCritic, now)
            .await
            .unwrap());

        let running = ProcessPatch::status(ProcessStatus::Running);
        assert!(store
            .update_process(process.id, &[ProcessStatus::Start], &running, now)
            .await
            .unwrap());
        assert!(store
            .advance_stage(process.id, Stage::RubricGen, Stage::RubricCritic, now)
            .await
            .unwrap());
        assert!(!store
            .advance_stage(process.id, Stage::RubricGen, Stage::RubricCritic, now)
            .await
            .unwrap());
        let loaded = store.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::RubricCritic);
    }

    #[tokio::test]
    async fn test_update_process_is_conditional_on_status() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let process = Process::new(Uuid::new_v4(), ProcessKind::Window, RunPolicy::default(), now);
        store.insert_process(&process).await.unwrap();

        let cancel = ProcessPatch::status(ProcessStatus::Canceled);
        assert!(store
            .update_process(process.id, &ProcessStatus::ACTIVE, &cancel, now)
            .await
            .unwrap());
        let complete = ProcessPatch::status(ProcessStatus::Completed);
        assert!(!store
            .update_process(process.id, &[ProcessStatus::Running], &complete, now)
            .await
            .unwrap());
        let loaded = store.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ProcessStatus::Canceled);

        let missing = store
            .update_process(Uuid::new_v4(), &ProcessStatus::ACTIVE, &cancel, now)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_scheduler_lock() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let until = now + Duration::seconds(30);
        assert!(store.try_lock_scheduler(now, until).await.unwrap());
        assert!(!store.try_lock_scheduler(now, until).await.unwrap());
        assert!(store.try_lock_scheduler(until, until + Duration::seconds(30)).await.unwrap());
    }
}
