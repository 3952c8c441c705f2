// Workers are stopped with SIGTERM and shutdown listens for unix signals.
#[cfg(not(unix))]
compile_error!("mapcad-jobs supports unix targets only");

pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod retention;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{MapcadError, Result};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
