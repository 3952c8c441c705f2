use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MapcadError;
use crate::scheduler::Job;

/// Terminal result of one worker invocation.
#[derive(Debug)]
pub enum OutcomeKind {
    /// Worker exited successfully and emitted a result document
    Succeeded { result: serde_json::Value },
    /// Worker failed, produced unparseable output, or timed out
    Failed(MapcadError),
    /// Worker stopped because cancellation was requested
    Cancelled,
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub job_id: Uuid,
    pub elapsed: Duration,
    pub kind: OutcomeKind,
}

impl ExecutionOutcome {
    pub fn succeeded(job_id: Uuid, result: serde_json::Value, elapsed: Duration) -> Self {
        Self {
            job_id,
            elapsed,
            kind: OutcomeKind::Succeeded { result },
        }
    }

    pub fn failed(job_id: Uuid, error: MapcadError, elapsed: Duration) -> Self {
        Self {
            job_id,
            elapsed,
            kind: OutcomeKind::Failed(error),
        }
    }

    pub fn cancelled(job_id: Uuid, elapsed: Duration) -> Self {
        Self {
            job_id,
            elapsed,
            kind: OutcomeKind::Cancelled,
        }
    }
}

/// Runs one job to a terminal outcome.
///
/// Implementations must always return, must honor `cancel` (returning
/// [`OutcomeKind::Cancelled`] once the work has stopped), and must never
/// touch the job store. The orchestrator applies the outcome.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: Job, cancel: CancellationToken) -> ExecutionOutcome;
}
