//! Execution of generation jobs.
//!
//! - [`JobRunner`]: the seam the orchestrator dispatches through; it knows
//!   nothing about processes or signals
//! - [`JobExecutor`]: runner backed by the external generation worker process
//!
//! # Execution Flow
//!
//! 1. The orchestrator promotes a job to `Running` and calls [`JobRunner::run`]
//! 2. [`JobExecutor::execute`] spawns `program args.. --output <path> --lat ..`
//! 3. The child is raced against the timeout and the job's cancellation token
//! 4. An [`ExecutionOutcome`] goes back over the orchestrator's outcome channel

pub mod executor;
pub mod runner;

pub use executor::JobExecutor;
pub use runner::{ExecutionOutcome, JobRunner, OutcomeKind};
