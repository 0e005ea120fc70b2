//! Scheduler ticks driving whole pipelines over the in-memory store.

mod common;

use common::{at, t0, test_policy, Harness};
use eval_forge::models::{
    BatchStatus, DesiredState, JobStatus, LlmJob, ProcessKey, ProcessKind, ProcessStatus,
    Provider, Stage,
};
use eval_forge::pipeline::{EvidenceView, Experiment, ExperimentRepository, Run, Sample};
use eval_forge::scheduler::Scheduler;
use eval_forge::storage::Store;
use uuid::Uuid;

async fn queued_window(h: &Harness, texts: &[&str]) -> (Uuid, Vec<Uuid>) {
    let (window_id, ids) = h.window("gpt-4.1", texts).await;
    h.lifecycle()
        .create_process(ProcessKind::Window, window_id, test_policy(), None, t0())
        .await
        .unwrap();
    h.lifecycle().request_start(window_id, t0()).await.unwrap();
    (window_id, ids)
}

#[tokio::test]
async fn test_ticks_drive_batch_pipeline_to_completion() {
    let h = Harness::new();
    let (window_id, ids) = queued_window(&h, &["alpha", "beta", "gamma"]).await;
    assert_eq!(h.process(window_id).await.status, ProcessStatus::Queued);

    let scheduler = Scheduler::new(h.ctx.clone());
    let first = scheduler.tick(t0()).await.unwrap();
    assert!(first.ran);
    assert_eq!(first.launched, 1);
    assert_eq!(first.submitted, 1);
    assert_eq!(first.errors, 0);

    for step in 1..=3 {
        let report = scheduler.tick(at(step * 2)).await.unwrap();
        assert_eq!(report.polled, 1, "tick {}", step);
    }

    let process = h.process(window_id).await;
    assert_eq!(process.status, ProcessStatus::Completed);
    assert_eq!(process.current_stage, Stage::EvidenceAbstract);
    for id in ids {
        assert!(h.evidence(id).await.abstracted.is_some());
    }
    assert_eq!(h.batch.submits(), 3);
    assert!(h
        .store
        .all_batches()
        .await
        .iter()
        .all(|b| b.status == BatchStatus::Success));
}

#[tokio::test]
async fn test_ticks_drive_experiment_run_to_completion() {
    let h = Harness::new();
    let (window_id, _) = h.window("gpt-4.1", &["first doc", "second doc"]).await;
    let experiment = Experiment {
        id: Uuid::new_v4(),
        concept: "civic trust".to_string(),
        scale_size: 5,
        rubric_model: "gpt-5.2-chat".to_string(),
        scoring_model: "gpt-4.1".to_string(),
        evidence_view: EvidenceView::Raw,
        evidence_window_id: window_id,
    };
    h.store.insert_experiment(&experiment).await.unwrap();
    let run = Run {
        id: Uuid::new_v4(),
        experiment_id: experiment.id,
    };
    h.store.insert_run(&run).await.unwrap();
    let mut sample_ids = Vec::new();
    for seed in 0..3 {
        let sample = Sample::new(run.id, seed);
        sample_ids.push(sample.id);
        h.store.insert_sample(&sample).await.unwrap();
    }

    h.lifecycle()
        .create_process(ProcessKind::Run, run.id, test_policy(), None, t0())
        .await
        .unwrap();
    h.lifecycle().request_start(run.id, t0()).await.unwrap();

    let scheduler = Scheduler::new(h.ctx.clone());
    for step in 0..10 {
        scheduler.tick(at(step * 2)).await.unwrap();
    }

    let process = h.process(run.id).await;
    assert_eq!(process.status, ProcessStatus::Completed);
    for id in sample_ids {
        let sample = h.store.get_sample(id).await.unwrap().unwrap();
        assert!(sample.rubric.is_some());
        assert!(sample.rubric_critique.is_some());
        assert!(sample.score.is_some());
        assert!(sample.score_critique.is_some());
    }
    // Rubric stages ran as jobs, scoring stages as batches.
    assert_eq!(h.store.all_jobs().await.len(), 2);
    assert_eq!(h.store.all_batches().await.len(), 2);
}

#[tokio::test]
async fn test_held_lock_skips_tick() {
    let h = Harness::new();
    assert!(h.store.try_lock_scheduler(t0(), at(30)).await.unwrap());

    let scheduler = Scheduler::new(h.ctx.clone());
    let skipped = scheduler.tick(at(1)).await.unwrap();
    assert!(!skipped.ran);

    let report = scheduler.tick(at(31)).await.unwrap();
    assert!(report.ran);
    // No active processes: the default poll interval applies.
    assert_eq!(report.next_tick_at, Some(at(36)));
    let state = h.store.get_scheduler_state().await.unwrap();
    assert_eq!(state.locked_until, None);
    assert_eq!(state.next_tick_at, Some(at(36)));
}

#[tokio::test]
async fn test_ensure_scheduler_is_idempotent() {
    let h = Harness::new();
    let scheduler = Scheduler::new(h.ctx.clone());
    let first = scheduler.ensure_scheduler(t0()).await.unwrap();
    let expected = t0() + chrono::Duration::milliseconds(500);
    assert_eq!(first.next_tick_at, Some(expected));

    let again = scheduler.ensure_scheduler(t0()).await.unwrap();
    assert_eq!(again.next_tick_at, Some(expected));

    let later = scheduler.ensure_scheduler(at(5)).await.unwrap();
    assert_eq!(later.next_tick_at, Some(at(5) + chrono::Duration::milliseconds(500)));
}

#[tokio::test]
async fn test_one_new_batch_per_model_per_tick() {
    let h = Harness::new();
    let (a, _) = queued_window(&h, &["a1", "a2", "a3"]).await;
    let (b, _) = queued_window(&h, &["b1", "b2", "b3"]).await;

    let scheduler = Scheduler::new(h.ctx.clone());
    let first = scheduler.tick(t0()).await.unwrap();
    assert_eq!(first.launched, 2);
    assert_eq!(first.submitted, 1);

    let in_flight = |batches: Vec<eval_forge::models::LlmBatch>, pid: Uuid| {
        batches
            .into_iter()
            .filter(|x| x.key.process_id == pid && x.key.stage == Stage::EvidenceClean)
            .all(|x| x.status == BatchStatus::Submitted)
    };
    let batches = h.store.all_batches().await;
    assert_ne!(in_flight(batches.clone(), a), in_flight(batches, b));

    let second = scheduler.tick(at(1)).await.unwrap();
    assert_eq!(second.submitted, 1);
    let clean: Vec<_> = h
        .store
        .all_batches()
        .await
        .into_iter()
        .filter(|x| x.key.stage == Stage::EvidenceClean)
        .collect();
    assert!(clean.iter().all(|x| x.status != BatchStatus::Queued));
}

#[tokio::test]
async fn test_canceled_process_work_is_held_back() {
    let h = Harness::new();
    let (window_id, _) = queued_window(&h, &["alpha", "beta", "gamma"]).await;
    let scheduler = Scheduler::new(h.ctx.clone());

    // Launch only: cancel before anything is submitted.
    h.lifecycle().start(window_id, t0()).await.unwrap();
    h.lifecycle()
        .set_desired_state(window_id, DesiredState::Canceled, t0())
        .await
        .unwrap();

    let report = scheduler.tick(at(1)).await.unwrap();
    assert_eq!(report.submitted, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.batch.submits(), 0);
    let batch = h.store.all_batches().await.remove(0);
    assert_eq!(batch.status, BatchStatus::Queued);
}

#[tokio::test]
async fn test_pause_drains_current_stage_only() {
    let h = Harness::new();
    let (window_id, _) = queued_window(&h, &["alpha", "beta", "gamma"]).await;
    let scheduler = Scheduler::new(h.ctx.clone());
    scheduler.tick(t0()).await.unwrap();

    h.lifecycle()
        .set_desired_state(window_id, DesiredState::Paused, at(1))
        .await
        .unwrap();
    scheduler.tick(at(2)).await.unwrap();
    scheduler.tick(at(4)).await.unwrap();

    let process = h.process(window_id).await;
    assert_eq!(process.status, ProcessStatus::Paused);
    assert_eq!(process.current_stage, Stage::EvidenceClean);
    assert_eq!(h.store.all_batches().await.len(), 1);
    assert_eq!(h.batch.submits(), 1);
}

#[tokio::test]
async fn test_tick_survives_failing_entity() {
    let h = Harness::new();
    let orphan_key = ProcessKey::new(ProcessKind::Window, Uuid::new_v4(), Stage::EvidenceClean);
    let orphan = LlmJob::new(orphan_key, "gpt-5.2-chat", Provider::Openai, t0());
    h.store.insert_job(&orphan).await.unwrap();
    let (window_id, _) = queued_window(&h, &["alpha", "beta", "gamma"]).await;

    let report = Scheduler::new(h.ctx.clone()).tick(t0()).await.unwrap();
    assert!(report.ran);
    assert_eq!(report.errors, 1);
    assert_eq!(report.submitted, 1);

    let orphan = h.store.get_job(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, JobStatus::Error);
    assert_eq!(h.process(window_id).await.status, ProcessStatus::Running);
    let state = h.store.get_scheduler_state().await.unwrap();
    assert!(state.locked_until.is_none());
}
