use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{MapcadError, Result};
use crate::scheduler::job::{GenerationPayload, Job, JobStatus, JobSummary, Transition};

/// What a cancellation request did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Job was still queued and is now cancelled
    Cancelled,
    /// Job is running; its worker must be told to stop
    SignalRunning,
    /// Job was already terminal; nothing changed
    Unchanged(JobStatus),
}

/// Authoritative registry of jobs.
///
/// Owned by exactly one task (the orchestrator); every mutation goes
/// through [`JobStore::transition`] or [`JobStore::cancel`], which enforce
/// the job state machine.
#[derive(Debug)]
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
    output_dir: PathBuf,
    next_sequence: u64,
}

impl JobStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs: HashMap::new(),
            output_dir: output_dir.into(),
            next_sequence: 0,
        }
    }

    /// Rebuild a store from persisted records.
    pub fn from_jobs(output_dir: impl Into<PathBuf>, jobs: Vec<Job>) -> Self {
        let next_sequence = jobs.iter().map(|j| j.sequence + 1).max().unwrap_or(0);
        Self {
            jobs: jobs.into_iter().map(|j| (j.id, j)).collect(),
            output_dir: output_dir.into(),
            next_sequence,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Validate and register a new queued job.
    pub fn submit(&mut self, payload: GenerationPayload) -> Result<Job> {
        payload.validate()?;
        let job = Job::new(payload, self.next_sequence, &self.output_dir);
        self.next_sequence += 1;
        tracing::debug!(job_id = %job.id, sequence = job.sequence, "Job queued");
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: &Uuid) -> Result<&Job> {
        self.jobs.get(id).ok_or(MapcadError::JobNotFound(*id))
    }

    /// Summaries ordered by creation, newest first when `most_recent_first`.
    pub fn list(&self, limit: usize, most_recent_first: bool) -> Vec<JobSummary> {
        let mut jobs = self.all_jobs();
        if most_recent_first {
            jobs.reverse();
        }
        jobs.into_iter().take(limit).map(Job::summary).collect()
    }

    /// All jobs sorted oldest first.
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.fifo_key());
        jobs
    }

    /// Queued jobs in dispatch order.
    pub fn queued_in_order(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        jobs.sort_by_key(|j| j.fifo_key());
        jobs
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }

    /// Apply a state change, rejecting anything outside the state machine.
    pub fn transition(&mut self, id: &Uuid, transition: Transition) -> Result<&Job> {
        let job = self.jobs.get_mut(id).ok_or(MapcadError::JobNotFound(*id))?;
        let to = transition.target();
        if !job.status.can_transition_to(to) {
            return Err(MapcadError::InvalidTransition {
                job_id: *id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        match transition {
            Transition::Start { at } => {
                job.started_at = Some(at);
            }
            Transition::Complete {
                at,
                result,
                download_url,
            } => {
                finish(job, at);
                job.result = Some(result);
                job.download_url = Some(download_url);
            }
            Transition::Fail { at, error, kind } => {
                finish(job, at);
                job.error = Some(error);
                job.error_kind = Some(kind);
            }
            Transition::Cancel { at } => {
                finish(job, at);
                job.cancel_requested = true;
                job.error = Some("cancelled by request".to_string());
            }
        }
        Ok(job)
    }

    /// Handle a cancellation request. Idempotent.
    pub fn cancel(&mut self, id: &Uuid, at: DateTime<Utc>) -> Result<CancelDisposition> {
        let status = self.get(id)?.status;
        match status {
            JobStatus::Queued => {
                self.transition(id, Transition::Cancel { at })?;
                Ok(CancelDisposition::Cancelled)
            }
            JobStatus::Running => {
                if let Some(job) = self.jobs.get_mut(id) {
                    job.cancel_requested = true;
                }
                Ok(CancelDisposition::SignalRunning)
            }
            terminal => Ok(CancelDisposition::Unchanged(terminal)),
        }
    }

    /// Drop a record. Running jobs are never removed.
    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        match self.jobs.get(id) {
            Some(job) if job.status == JobStatus::Running => {
                tracing::warn!(job_id = %id, "Refusing to remove running job");
                None
            }
            Some(_) => self.jobs.remove(id),
            None => None,
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn finish(job: &mut Job, at: DateTime<Utc>) {
    job.finished_at = Some(at);
    job.elapsed_ms = job
        .started_at
        .map(|started| (at - started).num_milliseconds().max(0) as u64);
}
