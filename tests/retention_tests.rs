
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use mapcad_jobs::config::RetentionConfig;
use mapcad_jobs::retention::RetentionManager;
use mapcad_jobs::scheduler::{GenerationPayload, JobStatus, JobStore, Transition};
use test_harness::{test_config, FakeMode, FakeRunner, TestOrchestrator};

const WAIT: Duration = Duration::from_secs(5);

fn payload() -> GenerationPayload {
    GenerationPayload::new(-33.875, 151.25, 1000.0)
}

fn retention(max_age_secs: u64, max_jobs: usize) -> RetentionConfig {
    RetentionConfig {
        max_age_secs,
        max_jobs,
        sweep_interval_secs: 3600,
    }
}

#[tokio::test]
async fn test_count_limit_removes_oldest_jobs_and_artifacts() {
    const MAX_JOBS: usize = 3;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2).with_retention(retention(3600, MAX_JOBS));
    let runner = FakeRunner::new(FakeMode::Succeed, Duration::ZERO);
    let orch = TestOrchestrator::start(config, runner).await;

    let mut jobs = Vec::new();
    for _ in 0..MAX_JOBS + 5 {
        let id = orch.handle.submit(payload()).await.unwrap().job_id;
        jobs.push(orch.wait_for_terminal(id, WAIT).await.unwrap());
    }
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert!(jobs.iter().all(|j| j.output_path.exists()));

    let report = orch.handle.sweep().await.unwrap();

    let expected: Vec<_> = jobs[..5].iter().map(|j| j.id).collect();
    assert_eq!(report.removed, expected);
    assert_eq!(report.artifacts_deleted, 5);
    assert_eq!(orch.handle.list(100, true).await.unwrap().len(), MAX_JOBS);

    for job in &jobs[..5] {
        assert!(!job.output_path.exists());
        assert!(orch.handle.status(job.id).await.is_err());
    }
    for job in &jobs[5..] {
        assert!(job.output_path.exists());
        assert_eq!(orch.status(job.id).await, JobStatus::Completed);
    }

    orch.stop().await;
}

#[tokio::test]
async fn test_sweep_never_removes_active_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 1).with_retention(retention(3600, 0));
    let runner = FakeRunner::gated(FakeMode::Succeed);
    let orch = TestOrchestrator::start(config, runner.clone()).await;

    let running = orch.handle.submit(payload()).await.unwrap().job_id;
    let queued = orch.handle.submit(payload()).await.unwrap().job_id;
    assert!(orch.wait_for_status(running, JobStatus::Running, WAIT).await);

    let report = orch.handle.sweep().await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(orch.status(running).await, JobStatus::Running);
    assert_eq!(orch.status(queued).await, JobStatus::Queued);

    runner.open_gate();
    assert!(orch.wait_for_terminal(queued, WAIT).await.is_some());

    let report = orch.handle.sweep().await.unwrap();
    assert_eq!(report.removed, vec![running, queued]);
    assert!(orch.handle.list(10, true).await.unwrap().is_empty());

    orch.stop().await;
}

#[tokio::test]
async fn test_age_limit_deletes_expired_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let outputs = dir.path().join("outputs");
    std::fs::create_dir_all(&outputs).unwrap();
    let mut store = JobStore::new(&outputs);

    let at = Utc::now();
    let id = store.submit(payload()).unwrap().id;
    store.transition(&id, Transition::Start { at }).unwrap();
    store
        .transition(
            &id,
            Transition::Complete {
                at,
                result: json!({"source": "live"}),
                download_url: String::new(),
            },
        )
        .unwrap();
    let artifact = store.get(&id).unwrap().output_path.clone();
    std::fs::write(&artifact, b"DXF").unwrap();

    let manager = RetentionManager::new(retention(60, 100));

    let report = manager.sweep(&mut store, Utc::now()).await;
    assert!(report.removed.is_empty());
    assert!(artifact.exists());

    let later = Utc::now() + chrono::Duration::seconds(120);
    let report = manager.sweep(&mut store, later).await;
    assert_eq!(report.removed, vec![id]);
    assert_eq!(report.artifacts_deleted, 1);
    assert!(!artifact.exists());
    assert!(store.is_empty());
}
