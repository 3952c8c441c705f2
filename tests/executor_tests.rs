
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mapcad_jobs::config::WorkerConfig;
use mapcad_jobs::error::MapcadError;
use mapcad_jobs::scheduler::{FailureKind, GenerationPayload, Job, JobStatus, QualityTier};
use mapcad_jobs::worker::{JobExecutor, OutcomeKind};
use test_harness::{test_config, TestOrchestrator};
use tokio_util::sync::CancellationToken;

/// Executor running `script` through `sh -c`; `$1` is `--output` and `$2`
/// the artifact path.
fn sh_executor(script: &str) -> JobExecutor {
    JobExecutor::new(sh_worker(script))
}

fn sh_worker(script: &str) -> WorkerConfig {
    WorkerConfig::new(
        "sh",
        vec![
            "-c".to_string(),
            script.to_string(),
            "mapcad-worker".to_string(),
        ],
    )
}

fn test_job(dir: &Path) -> Job {
    Job::new(GenerationPayload::new(48.5, 7.25, 250.0), 0, dir)
}

#[tokio::test]
async fn test_execute_success_returns_result_document() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor(r#"touch "$2"; echo '{"source":"live","layers":4}'"#);
    let job = test_job(dir.path());

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    assert_eq!(outcome.job_id, job.id);
    match outcome.kind {
        OutcomeKind::Succeeded { result } => {
            assert_eq!(result["layers"], 4);
            assert_eq!(result["source"], "live");
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert!(job.output_path.exists());
}

#[tokio::test]
async fn test_execute_passes_payload_as_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor(r#"printf '{"argv":"%s"}' "$*""#);
    let bounds = "48.4,7.1,48.6,7.4".parse().unwrap();
    let job = Job::new(
        GenerationPayload::new(48.5, 7.25, 250.0)
            .with_quality(QualityTier::High)
            .with_strict(true)
            .with_bounds(bounds),
        0,
        dir.path(),
    );

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    let OutcomeKind::Succeeded { result } = outcome.kind else {
        panic!("expected success");
    };
    let argv = result["argv"].as_str().unwrap();
    assert!(argv.starts_with(&format!("--output {}", job.output_path.display())));
    assert!(argv.contains("--lat 48.5 --lon 7.25 --radius 250"));
    assert!(argv.contains("--quality high --strict"));
    assert!(argv.ends_with("--bounds 48.4,7.1,48.6,7.4"));
}

#[tokio::test]
async fn test_execute_creates_output_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b");
    let executor = sh_executor(r#"touch "$2" && echo '{}'"#);
    let job = test_job(&nested);

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    assert!(matches!(outcome.kind, OutcomeKind::Succeeded { .. }));
    assert!(nested.is_dir());
}

#[tokio::test]
async fn test_execute_failure_reports_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor("echo 'no data for area' >&2; exit 3");
    let job = test_job(dir.path());

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    match outcome.kind {
        OutcomeKind::Failed(err) => {
            assert_eq!(err.failure_kind(), FailureKind::Execution);
            assert!(err.to_string().contains("no data for area"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_failure_without_stderr_reports_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor("exit 2");
    let job = test_job(dir.path());

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    let OutcomeKind::Failed(err) = outcome.kind else {
        panic!("expected failure");
    };
    assert!(err.to_string().contains("worker exited with"));
}

#[tokio::test]
async fn test_execute_unparseable_output_keeps_raw_output() {
    let dir = tempfile::tempdir().unwrap();
    let executor = sh_executor("echo 'Traceback: something broke'");
    let job = test_job(dir.path());

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    match outcome.kind {
        OutcomeKind::Failed(MapcadError::Execution { raw_output, .. }) => {
            assert!(raw_output.unwrap().contains("Traceback: something broke"));
        }
        other => panic!("expected execution failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_keeps_output_when_descendant_holds_pipe() {
    let dir = tempfile::tempdir().unwrap();
    // The background sleep inherits stdout and keeps it open past exit
    let executor = JobExecutor::new(
        sh_worker(r#"touch "$2"; echo '{"source":"live"}'; sleep 3 &"#).with_cancel_grace_ms(0),
    );
    let job = test_job(dir.path());

    let started = Instant::now();
    let outcome = executor.execute(&job, CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    match outcome.kind {
        OutcomeKind::Succeeded { result } => assert_eq!(result["source"], "live"),
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_failure_keeps_partial_output_when_pipe_held() {
    let dir = tempfile::tempdir().unwrap();
    let executor = JobExecutor::new(
        sh_worker("echo 'partial render'; sleep 3 & exit 4").with_cancel_grace_ms(500),
    );
    let job = test_job(dir.path());

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    match outcome.kind {
        OutcomeKind::Failed(MapcadError::Execution { raw_output, .. }) => {
            assert!(raw_output.unwrap().contains("partial render"));
        }
        other => panic!("expected execution failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let executor = JobExecutor::new(sh_worker("exec sleep 5").with_timeout_ms(1000));
    let job = test_job(dir.path());

    let started = Instant::now();
    let outcome = executor.execute(&job, CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    match outcome.kind {
        OutcomeKind::Failed(err) => {
            assert!(matches!(err, MapcadError::Timeout { timeout_ms: 1000 }));
            assert_eq!(err.failure_kind(), FailureKind::Timeout);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_stops_worker_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let executor = JobExecutor::new(
        sh_worker("trap 'exit 0' TERM; while true; do sleep 0.1; done").with_cancel_grace_ms(5000),
    );
    let job = test_job(dir.path());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = executor.execute(&job, cancel).await;

    assert!(matches!(outcome.kind, OutcomeKind::Cancelled));
    // Exited on SIGTERM well before the grace period ran out
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_cancel_kills_worker_ignoring_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let executor = JobExecutor::new(
        sh_worker("trap '' TERM; while true; do sleep 0.1; done").with_cancel_grace_ms(300),
    );
    let job = test_job(dir.path());
    let cancel = CancellationToken::new();

    // Give the shell time to install its trap
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = executor.execute(&job, cancel).await;

    assert!(matches!(outcome.kind, OutcomeKind::Cancelled));
    assert!(started.elapsed() >= Duration::from_millis(550));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_execute_missing_program() {
    let dir = tempfile::tempdir().unwrap();
    let executor = JobExecutor::new(WorkerConfig::new("/nonexistent/mapcad-worker", vec![]));
    let job = test_job(dir.path());

    let outcome = executor.execute(&job, CancellationToken::new()).await;

    let OutcomeKind::Failed(err) = outcome.kind else {
        panic!("expected failure");
    };
    assert!(err.to_string().contains("failed to launch worker"));
}

#[tokio::test]
async fn test_orchestrator_fails_timed_out_worker() {
    let dir = tempfile::tempdir().unwrap();
    let worker = sh_worker("exec sleep 5").with_timeout_ms(1000);
    let config = test_config(dir.path(), 1).with_worker(worker.clone());
    let orch = TestOrchestrator::start(config, Arc::new(JobExecutor::new(worker))).await;

    let started = Instant::now();
    let id = orch
        .handle
        .submit(GenerationPayload::new(48.5, 7.25, 250.0))
        .await
        .unwrap()
        .job_id;
    let job = orch
        .wait_for_terminal(id, Duration::from_secs(4))
        .await
        .expect("job did not finish");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(FailureKind::Timeout));
    assert!(job.error.unwrap().contains("1000ms"));

    orch.stop().await;
}

#[tokio::test]
async fn test_orchestrator_completes_with_real_worker() {
    let dir = tempfile::tempdir().unwrap();
    let worker = sh_worker(r#"echo DXF > "$2"; echo '{"source":"fallback"}'"#);
    let config = test_config(dir.path(), 1).with_worker(worker.clone());
    let orch = TestOrchestrator::start(config, Arc::new(JobExecutor::new(worker))).await;

    let id = orch
        .handle
        .submit(GenerationPayload::new(48.5, 7.25, 250.0))
        .await
        .unwrap()
        .job_id;
    let job = orch.wait_for_terminal(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        std::fs::read_to_string(&job.output_path).unwrap().trim(),
        "DXF"
    );

    orch.stop().await;
}
