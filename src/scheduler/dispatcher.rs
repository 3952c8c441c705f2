use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::job::{Job, Transition};
use crate::scheduler::store::JobStore;

/// A job promoted to `Running`, ready to be handed to a runner.
#[derive(Debug)]
pub struct Dispatched {
    pub job: Job,
    pub cancel: CancellationToken,
}

/// Enforces the concurrency bound and tracks one cancellation token per
/// running job.
#[derive(Debug)]
pub struct Dispatcher {
    max_concurrency: usize,
    active: HashMap<Uuid, CancellationToken>,
}

impl Dispatcher {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            active: HashMap::new(),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.active.len())
    }

    pub fn is_active(&self, job_id: &Uuid) -> bool {
        self.active.contains_key(job_id)
    }

    /// Queued jobs that the next pass would start, oldest first.
    pub fn next_batch(&self, store: &JobStore) -> Vec<Uuid> {
        store
            .queued_in_order()
            .into_iter()
            .filter(|j| !j.cancel_requested)
            .take(self.available_slots())
            .map(|j| j.id)
            .collect()
    }

    /// Promote as many queued jobs as the bound allows.
    pub fn dispatch_pass(&mut self, store: &mut JobStore, at: DateTime<Utc>) -> Vec<Dispatched> {
        let mut dispatched = Vec::new();
        for job_id in self.next_batch(store) {
            match store.transition(&job_id, Transition::Start { at }) {
                Ok(job) => {
                    let cancel = CancellationToken::new();
                    self.active.insert(job_id, cancel.clone());
                    tracing::info!(
                        job_id = %job_id,
                        active = self.active.len(),
                        max = self.max_concurrency,
                        "Job dispatched"
                    );
                    dispatched.push(Dispatched {
                        job: job.clone(),
                        cancel,
                    });
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Dispatch transition rejected");
                }
            }
        }
        dispatched
    }

    /// Forward a cancellation to a running job's runner.
    /// Returns false if the job has no active invocation.
    pub fn request_cancel(&self, job_id: &Uuid) -> bool {
        match self.active.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Free the slot held by a finished invocation.
    pub fn release(&mut self, job_id: &Uuid) -> bool {
        self.active.remove(job_id).is_some()
    }
}
