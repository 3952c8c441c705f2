use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::scheduler::JobStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed: Vec<Uuid>,
    pub artifacts_deleted: usize,
    pub artifact_errors: usize,
}

/// Prunes finished jobs by age and by total count.
///
/// Only terminal jobs are eligible: running work is never touched and queued
/// work is never silently discarded, though both count toward `max_jobs`.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Jobs the next sweep would remove, oldest first.
    pub fn select_expired(&self, store: &JobStore, now: DateTime<Utc>) -> Vec<Uuid> {
        let max_age = self.config.max_age();
        let mut excess = store.len().saturating_sub(self.config.max_jobs);

        store
            .all_jobs()
            .into_iter()
            .filter(|job| job.status.is_terminal())
            .filter(|job| {
                let expired = now
                    .signed_duration_since(job.created_at)
                    .to_std()
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if expired || excess > 0 {
                    excess = excess.saturating_sub(1);
                    true
                } else {
                    false
                }
            })
            .map(|job| job.id)
            .collect()
    }

    /// Remove expired jobs, deleting each artifact before its record.
    pub async fn sweep(&self, store: &mut JobStore, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for job_id in self.select_expired(store, now) {
            let path = match store.get(&job_id) {
                Ok(job) => job.output_path.clone(),
                Err(_) => continue,
            };

            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.artifacts_deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    report.artifact_errors += 1;
                    tracing::warn!(
                        job_id = %job_id,
                        path = %path.display(),
                        error = %e,
                        "Failed to delete artifact"
                    );
                }
            }

            if store.remove(&job_id).is_some() {
                report.removed.push(job_id);
            }
        }

        if !report.removed.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                artifacts_deleted = report.artifacts_deleted,
                remaining = store.len(),
                "Retention sweep"
            );
        }
        report
    }
}
