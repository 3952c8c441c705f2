//! Operational counters.
//!
//! Histograms are keyed by closed enums only, so their size is bounded no
//! matter what workers or callers send.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scheduler::{FailureKind, Job, JobStatus, QualityTier};

/// Which data source served a generation, as reported in the worker's
/// result document (`"source"` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Cache,
    Fallback,
    Unknown,
}

impl DataSource {
    pub fn from_result(result: &serde_json::Value) -> Self {
        match result.get("source").and_then(|s| s.as_str()) {
            Some(s) if s.eq_ignore_ascii_case("live") => DataSource::Live,
            Some(s) if s.eq_ignore_ascii_case("cache") => DataSource::Cache,
            Some(s) if s.eq_ignore_ascii_case("fallback") => DataSource::Fallback,
            _ => DataSource::Unknown,
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::Live => f.pad("live"),
            DataSource::Cache => f.pad("cache"),
            DataSource::Fallback => f.pad("fallback"),
            DataSource::Unknown => f.pad("unknown"),
        }
    }
}

/// Persisted counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsCounters {
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    #[serde(default)]
    pub jobs_cancelled: u64,
    pub request_count: u64,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub by_quality: BTreeMap<QualityTier, u64>,
    #[serde(default)]
    pub by_source: BTreeMap<DataSource, u64>,
    #[serde(default)]
    pub by_failure: BTreeMap<FailureKind, u64>,
}

/// Read-only view with derived statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: MetricsCounters,
    pub avg_duration_ms: f64,
    pub queue_depth: usize,
    pub active_jobs: usize,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    counters: MetricsCounters,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counters(counters: MetricsCounters) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> &MetricsCounters {
        &self.counters
    }

    /// Any submission attempt, accepted or not.
    pub fn record_request(&mut self) {
        self.counters.request_count += 1;
    }

    pub fn record_created(&mut self, job: &Job) {
        self.counters.jobs_created += 1;
        *self
            .counters
            .by_quality
            .entry(job.payload.quality)
            .or_default() += 1;
    }

    /// Record a job that just reached a terminal status.
    pub fn record_terminal(&mut self, job: &Job) {
        match job.status {
            JobStatus::Completed => {
                self.counters.jobs_completed += 1;
                self.add_duration(job);
                let source = job
                    .result
                    .as_ref()
                    .map(DataSource::from_result)
                    .unwrap_or(DataSource::Unknown);
                *self.counters.by_source.entry(source).or_default() += 1;
            }
            JobStatus::Failed => {
                self.counters.jobs_failed += 1;
                let kind = job.error_kind.unwrap_or(FailureKind::Execution);
                // Elapsed time of an interrupted job spans the downtime
                if kind != FailureKind::Interrupted {
                    self.add_duration(job);
                }
                *self.counters.by_failure.entry(kind).or_default() += 1;
            }
            JobStatus::Cancelled => {
                self.counters.jobs_cancelled += 1;
            }
            JobStatus::Queued | JobStatus::Running => {
                tracing::debug!(job_id = %job.id, status = %job.status, "Ignoring non-terminal job");
            }
        }
    }

    fn add_duration(&mut self, job: &Job) {
        if let Some(ms) = job.elapsed_ms {
            self.counters.total_duration_ms += ms;
        }
    }

    pub fn snapshot(&self, queue_depth: usize, active_jobs: usize) -> MetricsSnapshot {
        let interrupted = self
            .counters
            .by_failure
            .get(&FailureKind::Interrupted)
            .copied()
            .unwrap_or(0);
        let timed = (self.counters.jobs_completed + self.counters.jobs_failed)
            .saturating_sub(interrupted);
        let avg_duration_ms = if timed == 0 {
            0.0
        } else {
            self.counters.total_duration_ms as f64 / timed as f64
        };
        MetricsSnapshot {
            counters: self.counters.clone(),
            avg_duration_ms,
            queue_depth,
            active_jobs,
        }
    }
}
