use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::MapcadError;
use crate::scheduler::Job;
use crate::worker::runner::{ExecutionOutcome, JobRunner};

/// How the wait on the worker process ended.
enum WorkerExit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    CancelRequested,
}

/// Launches the external generation worker as a child process and
/// supervises it until it reaches a terminal outcome.
///
/// - Enforces a hard wall-clock timeout (force kill on expiry)
/// - Cancellation sends SIGTERM, waits the grace period, then kills
/// - On success, stdout must hold exactly one JSON result document
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: WorkerConfig,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Full argument list: configured base args followed by the job's
    /// output path and payload.
    pub fn build_args(&self, job: &Job) -> Vec<OsString> {
        let payload = &job.payload;
        let mut args: Vec<OsString> = self.config.args.iter().map(OsString::from).collect();

        args.push("--output".into());
        args.push(job.output_path.clone().into_os_string());
        args.push("--lat".into());
        args.push(payload.lat.to_string().into());
        args.push("--lon".into());
        args.push(payload.lon.to_string().into());
        args.push("--radius".into());
        args.push(payload.radius_m.to_string().into());
        args.push("--quality".into());
        args.push(payload.quality.as_str().into());
        if payload.strict {
            args.push("--strict".into());
        }
        if let Some(b) = &payload.bounds {
            args.push("--bounds".into());
            args.push(format!("{},{},{},{}", b.min_lat, b.min_lon, b.max_lat, b.max_lon).into());
        }
        args
    }

    /// Run the worker for `job` until it exits, times out, or is cancelled.
    pub async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome {
        let started = Instant::now();
        tracing::info!(
            job_id = %job.id,
            program = %self.config.program.display(),
            timeout_ms = self.config.timeout_ms,
            "Launching generation worker"
        );

        if let Some(parent) = job.output_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ExecutionOutcome::failed(
                    job.id,
                    MapcadError::execution(format!(
                        "cannot create output directory {}: {}",
                        parent.display(),
                        e
                    )),
                    started.elapsed(),
                );
            }
        }

        let spawned = Command::new(&self.config.program)
            .args(self.build_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to launch worker");
                return ExecutionOutcome::failed(
                    job.id,
                    MapcadError::execution(format!(
                        "failed to launch worker {}: {}",
                        self.config.program.display(),
                        e
                    )),
                    started.elapsed(),
                );
            }
        };

        let stdout = PipeReader::spawn(child.stdout.take());
        let stderr = PipeReader::spawn(child.stderr.take());

        let exit = tokio::select! {
            status = child.wait() => WorkerExit::Exited(status),
            _ = tokio::time::sleep(self.config.timeout()) => WorkerExit::TimedOut,
            _ = cancel.cancelled() => WorkerExit::CancelRequested,
        };

        match exit {
            WorkerExit::Exited(Ok(status)) => {
                let drain = self.config.output_drain();
                let (out, err) = tokio::join!(stdout.collect(drain), stderr.collect(drain));
                Self::interpret(job.id, status, out, err, started.elapsed())
            }
            WorkerExit::Exited(Err(e)) => {
                stdout.abort();
                stderr.abort();
                ExecutionOutcome::failed(
                    job.id,
                    MapcadError::execution(format!("failed to wait on worker: {}", e)),
                    started.elapsed(),
                )
            }
            WorkerExit::TimedOut => {
                tracing::warn!(
                    job_id = %job.id,
                    timeout_ms = self.config.timeout_ms,
                    "Worker exceeded timeout, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to kill timed out worker");
                }
                stdout.abort();
                stderr.abort();
                ExecutionOutcome::failed(
                    job.id,
                    MapcadError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    },
                    started.elapsed(),
                )
            }
            WorkerExit::CancelRequested => {
                self.stop_gracefully(job.id, &mut child).await;
                stdout.abort();
                stderr.abort();
                ExecutionOutcome::cancelled(job.id, started.elapsed())
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn stop_gracefully(&self, job_id: Uuid, child: &mut Child) {
        tracing::info!(job_id = %job_id, "Cancellation requested, terminating worker");
        if let Err(e) = send_terminate(child) {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to signal worker");
        }

        match tokio::time::timeout(self.config.cancel_grace(), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(job_id = %job_id, status = %status, "Worker stopped after cancellation");
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to wait on cancelled worker");
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    grace_ms = self.config.cancel_grace_ms,
                    "Worker ignored termination signal, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to kill worker");
                }
            }
        }
    }

    fn interpret(
        job_id: Uuid,
        status: ExitStatus,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    ) -> ExecutionOutcome {
        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("worker exited with {}", status)
            } else {
                stderr.trim().to_string()
            };
            tracing::info!(job_id = %job_id, status = %status, "Worker failed");
            return ExecutionOutcome::failed(
                job_id,
                MapcadError::Execution {
                    message,
                    raw_output: (!stdout.trim().is_empty()).then_some(stdout),
                },
                elapsed,
            );
        }

        match serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            Ok(result) => {
                tracing::info!(
                    job_id = %job_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Worker completed"
                );
                ExecutionOutcome::succeeded(job_id, result, elapsed)
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Worker output is not a result document");
                ExecutionOutcome::failed(
                    job_id,
                    MapcadError::Execution {
                        message: format!("worker output is not a valid result document: {}", e),
                        raw_output: Some(stdout),
                    },
                    elapsed,
                )
            }
        }
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(&self, job: Job, cancel: CancellationToken) -> ExecutionOutcome {
        self.execute(&job, cancel).await
    }
}

/// Background read of one worker pipe. Bytes land in a shared buffer as
/// they arrive, so whatever was read survives an aborted read.
struct PipeReader {
    task: JoinHandle<()>,
    buf: Arc<Mutex<Vec<u8>>>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        tracing::debug!(error = %e, "Worker pipe read failed");
                        break;
                    }
                }
            }
        });
        Self { task, buf }
    }

    fn abort(&self) {
        self.task.abort();
    }

    /// Wait up to `bound` for EOF, then return everything read so far.
    /// A descendant process may keep the pipe open after the worker exits.
    async fn collect(mut self, bound: Duration) -> String {
        match tokio::time::timeout(bound, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Worker pipe reader failed"),
            Err(_) => {
                tracing::debug!(
                    bound_ms = bound.as_millis() as u64,
                    "Worker pipe still open after exit, keeping partial output"
                );
                self.task.abort();
            }
        }
        let bytes = std::mem::take(&mut *lock(&self.buf));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn lock(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };
    let pid = i32::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}
