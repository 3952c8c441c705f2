use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{MapcadError, Result};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::persistence::{reconcile, PersistenceManager, Snapshot, SnapshotWriter};
use crate::retention::{RetentionManager, SweepReport};
use crate::scheduler::{
    CancelDisposition, CancelReceipt, Dispatched, Dispatcher, GenerationPayload, Job, JobReceipt,
    JobStatus, JobStore, JobSummary, Transition,
};
use crate::worker::{ExecutionOutcome, JobRunner, OutcomeKind};

const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// Requests handled by the orchestrator task
#[derive(Debug)]
enum Request {
    Submit {
        payload: GenerationPayload,
        response_tx: oneshot::Sender<Result<JobReceipt>>,
    },
    Status {
        job_id: Uuid,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    List {
        limit: usize,
        most_recent_first: bool,
        response_tx: oneshot::Sender<Vec<JobSummary>>,
    },
    Cancel {
        job_id: Uuid,
        response_tx: oneshot::Sender<Result<CancelReceipt>>,
    },
    Metrics {
        response_tx: oneshot::Sender<MetricsSnapshot>,
    },
    Sweep {
        response_tx: oneshot::Sender<SweepReport>,
    },
}

/// Cloneable client for the orchestrator task.
///
/// None of these calls wait on a worker; they only wait for the orchestrator
/// to process the request.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    request_tx: mpsc::Sender<Request>,
}

impl OrchestratorHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(build(tx))
            .await
            .map_err(|_| MapcadError::Unavailable)?;
        rx.await.map_err(|_| MapcadError::Unavailable)
    }

    /// Queue a generation job. Malformed payloads are rejected before any
    /// job is created.
    pub async fn submit(&self, payload: GenerationPayload) -> Result<JobReceipt> {
        self.call(|response_tx| Request::Submit {
            payload,
            response_tx,
        })
        .await?
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Job> {
        self.call(|response_tx| Request::Status {
            job_id,
            response_tx,
        })
        .await?
    }

    pub async fn list(&self, limit: usize, most_recent_first: bool) -> Result<Vec<JobSummary>> {
        self.call(|response_tx| Request::List {
            limit,
            most_recent_first,
            response_tx,
        })
        .await
    }

    /// Request cancellation. Idempotent; returns the job's current state.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelReceipt> {
        self.call(|response_tx| Request::Cancel {
            job_id,
            response_tx,
        })
        .await?
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        self.call(|response_tx| Request::Metrics { response_tx })
            .await
    }

    /// Run a retention sweep now instead of waiting for the next interval.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.call(|response_tx| Request::Sweep { response_tx })
            .await
    }
}

/// Single owner of all job state.
///
/// Runs as one task that serializes every mutation: requests from
/// [`OrchestratorHandle`]s, outcomes from executor tasks, and the
/// safety-net and retention timers all funnel through [`Orchestrator::run`].
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: JobStore,
    dispatcher: Dispatcher,
    metrics: MetricsAggregator,
    retention: RetentionManager,
    writer: Option<SnapshotWriter>,
    runner: Arc<dyn JobRunner>,
    request_rx: mpsc::Receiver<Request>,
    outcome_tx: mpsc::Sender<ExecutionOutcome>,
    outcome_rx: mpsc::Receiver<ExecutionOutcome>,
}

impl Orchestrator {
    /// Restore state from the snapshot (if configured) and spawn the
    /// orchestrator task.
    ///
    /// The task stops when `shutdown` is cancelled or every handle is
    /// dropped, persisting a final snapshot on the way out.
    pub async fn start(
        config: OrchestratorConfig,
        runner: Arc<dyn JobRunner>,
        shutdown: CancellationToken,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let persistence = config.snapshot_path.clone().map(PersistenceManager::new);

        let (store, metrics) = match &persistence {
            Some(manager) => Self::restore(&config, manager).await,
            None => (
                JobStore::new(config.output_dir.clone()),
                MetricsAggregator::new(),
            ),
        };

        let (request_tx, request_rx) = mpsc::channel(config.request_channel_capacity.max(1));
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);

        let orchestrator = Orchestrator {
            dispatcher: Dispatcher::new(config.max_concurrency),
            retention: RetentionManager::new(config.retention.clone()),
            writer: persistence.map(PersistenceManager::spawn_writer),
            config,
            store,
            metrics,
            runner,
            request_rx,
            outcome_tx,
            outcome_rx,
        };

        let task = tokio::spawn(orchestrator.run(shutdown));
        (OrchestratorHandle { request_tx }, task)
    }

    async fn restore(
        config: &OrchestratorConfig,
        manager: &PersistenceManager,
    ) -> (JobStore, MetricsAggregator) {
        match manager.load().await {
            Ok(Some(snapshot)) => {
                if snapshot.runtime_config != *config {
                    tracing::info!("Runtime config differs from snapshot, using current config");
                }
                let mut store = JobStore::from_jobs(config.output_dir.clone(), snapshot.jobs);
                let report = reconcile(&mut store, Utc::now()).await;
                let mut metrics = MetricsAggregator::from_counters(snapshot.metrics);
                for id in report.interrupted.iter().chain(report.cancelled.iter()) {
                    if let Ok(job) = store.get(id) {
                        metrics.record_terminal(job);
                    }
                }
                (store, metrics)
            }
            Ok(None) => {
                tracing::info!(path = %manager.path().display(), "No snapshot found, starting empty");
                (
                    JobStore::new(config.output_dir.clone()),
                    MetricsAggregator::new(),
                )
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load snapshot, starting empty");
                if matches!(e, MapcadError::SnapshotFormat(_)) {
                    match manager.quarantine().await {
                        Ok(moved) => {
                            tracing::warn!(path = %moved.display(), "Moved unreadable snapshot aside");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to move unreadable snapshot aside");
                        }
                    }
                }
                (
                    JobStore::new(config.output_dir.clone()),
                    MetricsAggregator::new(),
                )
            }
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let mut safety_net = tokio::time::interval(self.config.dispatch_interval());
        safety_net.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retention = tokio::time::interval(self.config.retention.sweep_interval());
        retention.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            max_concurrency = self.dispatcher.max_concurrency(),
            jobs = self.store.len(),
            "Orchestrator started"
        );
        self.dispatch();
        self.persist();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping orchestrator");
                    break;
                }

                request = self.request_rx.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => {
                            tracing::info!("All handles dropped, stopping orchestrator");
                            break;
                        }
                    }
                }

                Some(outcome) = self.outcome_rx.recv() => {
                    self.apply_outcome(outcome).await;
                }

                _ = safety_net.tick() => {
                    self.dispatch();
                }

                _ = retention.tick() => {
                    self.sweep().await;
                }
            }
        }

        if self.dispatcher.active_count() > 0 {
            tracing::warn!(
                active = self.dispatcher.active_count(),
                "Stopping with running jobs; they will be failed on next start"
            );
        }
        self.persist();
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Submit {
                payload,
                response_tx,
            } => {
                let _ = response_tx.send(self.submit(payload));
            }
            Request::Status {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.store.get(&job_id).cloned());
            }
            Request::List {
                limit,
                most_recent_first,
                response_tx,
            } => {
                let _ = response_tx.send(self.store.list(limit, most_recent_first));
            }
            Request::Cancel {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.cancel(job_id));
            }
            Request::Metrics { response_tx } => {
                let _ = response_tx.send(self.metrics_snapshot());
            }
            Request::Sweep { response_tx } => {
                let report = self.sweep().await;
                let _ = response_tx.send(report);
            }
        }
    }

    fn submit(&mut self, payload: GenerationPayload) -> Result<JobReceipt> {
        self.metrics.record_request();
        let job = match self.store.submit(payload) {
            Ok(job) => job,
            Err(e) => {
                tracing::info!(error = %e, "Submission rejected");
                return Err(e);
            }
        };
        self.metrics.record_created(&job);
        tracing::info!(job_id = %job.id, quality = %job.payload.quality, "Job submitted");

        let receipt = JobReceipt {
            job_id: job.id,
            status: job.status,
        };
        self.dispatch();
        self.persist();
        Ok(receipt)
    }

    fn cancel(&mut self, job_id: Uuid) -> Result<CancelReceipt> {
        let disposition = self.store.cancel(&job_id, Utc::now())?;
        match disposition {
            CancelDisposition::Cancelled => {
                tracing::info!(job_id = %job_id, "Queued job cancelled");
                if let Ok(job) = self.store.get(&job_id) {
                    self.metrics.record_terminal(job);
                }
                self.dispatch();
                self.persist();
            }
            CancelDisposition::SignalRunning => {
                if !self.dispatcher.request_cancel(&job_id) {
                    tracing::warn!(job_id = %job_id, "Running job has no active invocation");
                }
                self.persist();
            }
            CancelDisposition::Unchanged(status) => {
                tracing::debug!(job_id = %job_id, status = %status, "Cancel on finished job ignored");
            }
        }

        let job = self.store.get(&job_id)?;
        Ok(CancelReceipt {
            job_id,
            status: job.status,
            cancel_requested: job.cancel_requested,
        })
    }

    /// Promote queued jobs up to the concurrency bound and start their runners.
    fn dispatch(&mut self) {
        let dispatched = self.dispatcher.dispatch_pass(&mut self.store, Utc::now());
        if dispatched.is_empty() {
            return;
        }
        for Dispatched { job, cancel } in dispatched {
            self.spawn_runner(job, cancel);
        }
        self.persist();
    }

    fn spawn_runner(&self, job: Job, cancel: CancellationToken) {
        let runner = Arc::clone(&self.runner);
        let outcome_tx = self.outcome_tx.clone();
        let job_id = job.id;

        tokio::spawn(async move {
            let started = Instant::now();
            // A panicking runner must still produce an outcome
            let invocation = tokio::spawn(async move { runner.run(job, cancel).await });
            let outcome = match invocation.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Runner task aborted");
                    ExecutionOutcome::failed(
                        job_id,
                        MapcadError::execution(format!("runner task aborted: {}", e)),
                        started.elapsed(),
                    )
                }
            };
            if outcome_tx.send(outcome).await.is_err() {
                tracing::warn!(job_id = %job_id, "Orchestrator stopped before outcome was applied");
            }
        });
    }

    /// The single authoritative transition for a finished invocation.
    async fn apply_outcome(&mut self, outcome: ExecutionOutcome) {
        let job_id = outcome.job_id;
        if !self.dispatcher.release(&job_id) {
            tracing::warn!(job_id = %job_id, "Outcome for job that was not active");
        }

        let at = Utc::now();
        let transition = match outcome.kind {
            OutcomeKind::Succeeded { result } => {
                let artifact_present = match self.store.get(&job_id) {
                    Ok(job) => tokio::fs::try_exists(&job.output_path)
                        .await
                        .unwrap_or(false),
                    Err(_) => false,
                };
                if artifact_present {
                    Transition::Complete {
                        at,
                        result,
                        download_url: self.config.download_url_for(&job_id),
                    }
                } else {
                    let err = MapcadError::execution("worker reported success but wrote no artifact");
                    Transition::Fail {
                        at,
                        kind: err.failure_kind(),
                        error: err.diagnostic_message(),
                    }
                }
            }
            OutcomeKind::Failed(err) => Transition::Fail {
                at,
                kind: err.failure_kind(),
                error: err.diagnostic_message(),
            },
            OutcomeKind::Cancelled => Transition::Cancel { at },
        };

        match self.store.transition(&job_id, transition) {
            Ok(job) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %job.status,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Job finished"
                );
                self.metrics.record_terminal(job);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Outcome transition rejected");
            }
        }

        self.dispatch();
        self.persist();
    }

    async fn sweep(&mut self) -> SweepReport {
        let report = self.retention.sweep(&mut self.store, Utc::now()).await;
        if !report.removed.is_empty() {
            self.persist();
        }
        report
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.store.count(JobStatus::Queued),
            self.dispatcher.active_count(),
        )
    }

    /// Hand the current state to the background writer; never blocks.
    fn persist(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        writer.submit(Snapshot {
            runtime_config: self.config.clone(),
            metrics: self.metrics.counters().clone(),
            jobs: self.store.all_jobs().into_iter().cloned().collect(),
            persisted_at: Utc::now(),
        });
    }
}
