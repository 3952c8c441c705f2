//! Best-effort durability through a single JSON snapshot file.
//!
//! Every state-affecting mutation hands a full [`Snapshot`] to a
//! [`SnapshotWriter`], a background task that coalesces bursts and writes
//! with write-temp-then-rename so a crash never leaves a torn file.
//!
//! # Restart policy
//!
//! [`reconcile`] runs once on startup over the loaded jobs:
//! - `Running` jobs are failed as interrupted; their worker process is gone
//! - `Queued` jobs stay queued and are dispatched again
//! - `Completed` jobs whose artifact vanished are dropped

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{MapcadError, Result};
use crate::metrics::MetricsCounters;
use crate::scheduler::{FailureKind, Job, JobStatus, JobStore, Transition};

pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub runtime_config: OrchestratorConfig,
    pub metrics: MetricsCounters,
    pub jobs: Vec<Job>,
    pub persisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    path: PathBuf,
}

impl PersistenceManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling_path(".tmp")
    }

    /// Where an unreadable snapshot is moved before starting over.
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling_path(".corrupt")
    }

    /// Move the snapshot file aside so the next save cannot overwrite it.
    pub async fn quarantine(&self) -> Result<PathBuf> {
        let target = self.corrupt_path();
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(target)
    }

    fn io_error(&self, source: std::io::Error) -> MapcadError {
        MapcadError::Persistence {
            path: self.path.clone(),
            source,
        }
    }

    /// Write the snapshot atomically: temp file, fsync, rename.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        tracing::debug!(path = %self.path.display(), jobs = snapshot.jobs.len(), "Snapshot persisted");
        Ok(())
    }

    /// Load the last snapshot, `None` if none was ever written.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let snapshot = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot))
    }

    /// Start the background writer task for this file.
    pub fn spawn_writer(self) -> SnapshotWriter {
        let (tx, mut rx) = watch::channel::<Option<Arc<Snapshot>>>(None);
        let task = tokio::spawn(async move {
            loop {
                let closed = rx.changed().await.is_err();
                let latest = rx.borrow_and_update().clone();
                if let Some(snapshot) = latest {
                    if let Err(e) = self.save(&snapshot).await {
                        tracing::warn!(
                            error = %e,
                            "Failed to persist snapshot, continuing in memory"
                        );
                    }
                }
                if closed {
                    break;
                }
            }
        });
        SnapshotWriter { tx, task }
    }
}

/// Handle to the background snapshot writer.
///
/// [`SnapshotWriter::submit`] never blocks; only the newest pending
/// snapshot is written.
#[derive(Debug)]
pub struct SnapshotWriter {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
    task: JoinHandle<()>,
}

impl SnapshotWriter {
    pub fn submit(&self, snapshot: Snapshot) {
        self.tx.send_replace(Some(Arc::new(snapshot)));
    }

    /// Flush the latest snapshot and stop the writer.
    pub async fn close(self) {
        let SnapshotWriter { tx, task } = self;
        drop(tx);
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Snapshot writer task failed");
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub interrupted: Vec<Uuid>,
    pub requeued: usize,
    pub cancelled: Vec<Uuid>,
    pub dropped: Vec<Uuid>,
}

/// Bring a freshly loaded store back to a consistent state.
pub async fn reconcile(store: &mut JobStore, at: DateTime<Utc>) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let loaded: Vec<(Uuid, JobStatus, bool, PathBuf)> = store
        .jobs()
        .map(|j| (j.id, j.status, j.cancel_requested, j.output_path.clone()))
        .collect();

    for (id, status, cancel_requested, output_path) in loaded {
        match status {
            JobStatus::Running => {
                let transition = Transition::Fail {
                    at,
                    error: INTERRUPTED_MESSAGE.to_string(),
                    kind: FailureKind::Interrupted,
                };
                match store.transition(&id, transition) {
                    Ok(_) => report.interrupted.push(id),
                    Err(e) => tracing::error!(job_id = %id, error = %e, "Reconcile failed"),
                }
            }
            JobStatus::Queued if cancel_requested => {
                match store.transition(&id, Transition::Cancel { at }) {
                    Ok(_) => report.cancelled.push(id),
                    Err(e) => tracing::error!(job_id = %id, error = %e, "Reconcile failed"),
                }
            }
            JobStatus::Queued => report.requeued += 1,
            JobStatus::Completed => {
                let present = tokio::fs::try_exists(&output_path).await.unwrap_or(false);
                if !present && store.remove(&id).is_some() {
                    tracing::warn!(
                        job_id = %id,
                        path = %output_path.display(),
                        "Dropping completed job whose artifact is missing"
                    );
                    report.dropped.push(id);
                }
            }
            JobStatus::Failed | JobStatus::Cancelled => {}
        }
    }

    if !report.interrupted.is_empty() || report.requeued > 0 || !report.dropped.is_empty() {
        tracing::info!(
            interrupted = report.interrupted.len(),
            requeued = report.requeued,
            cancelled = report.cancelled.len(),
            dropped = report.dropped.len(),
            "Recovered jobs from snapshot"
        );
    }
    report
}
