use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::{FailureKind, JobStatus};

/// Raw worker output kept in a failed job's error text is capped at this many bytes.
const MAX_DIAGNOSTIC_OUTPUT: usize = 4096;

#[derive(Error, Debug)]
pub enum MapcadError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("execution error: {message}")]
    Execution {
        message: String,
        raw_output: Option<String>,
    },

    #[error("worker exceeded timeout of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("snapshot I/O failed at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot format error: {0}")]
    SnapshotFormat(#[from] serde_json::Error),

    #[error("orchestrator is not running")]
    Unavailable,
}

impl MapcadError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        MapcadError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        MapcadError::Execution {
            message: message.into(),
            raw_output: None,
        }
    }

    /// Failure category recorded on the job when this error ends its run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            MapcadError::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Execution,
        }
    }

    /// Error text stored on a failed job, including a bounded tail of any
    /// raw worker output.
    pub fn diagnostic_message(&self) -> String {
        match self {
            MapcadError::Execution {
                message,
                raw_output: Some(raw),
            } if !raw.trim().is_empty() => {
                format!(
                    "execution error: {}\n--- worker output ---\n{}",
                    message,
                    truncate_utf8(raw.trim(), MAX_DIAGNOSTIC_OUTPUT)
                )
            }
            other => other.to_string(),
        }
    }
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub type Result<T> = std::result::Result<T, MapcadError>;
