//! Job model, registry and dispatch.
//!
//! - [`Job`] / [`JobStatus`]: the job record and its state machine
//! - [`JobStore`]: single-writer registry, the source of truth for job state
//! - [`Dispatcher`]: concurrency bound and FIFO promotion of queued jobs

pub mod dispatcher;
pub mod job;
pub mod store;

pub use dispatcher::{Dispatched, Dispatcher};
pub use job::{
    CancelReceipt, FailureKind, GenerationPayload, GeoBounds, Job, JobReceipt, JobStatus,
    JobSummary, QualityTier, Transition,
};
pub use store::{CancelDisposition, JobStore};
