use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lower bound on the post-exit output read.
pub const MIN_OUTPUT_DRAIN_MS: u64 = 250;

/// How to launch the external generation worker.
///
/// The worker is invoked as `program args.. <job arguments>`, where the job
/// arguments are derived from the payload (see
/// [`JobExecutor::build_args`](crate::worker::JobExecutor::build_args)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable to run (e.g. `python3`)
    pub program: PathBuf,
    /// Fixed leading arguments (e.g. the worker script path)
    pub args: Vec<String>,
    /// Hard wall-clock limit for one invocation
    pub timeout_ms: u64,
    /// How long a worker may take to exit after SIGTERM before it is killed
    pub cancel_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["generate_dxf.py".to_string()],
            timeout_ms: 300_000,
            cancel_grace_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_cancel_grace_ms(mut self, cancel_grace_ms: u64) -> Self {
        self.cancel_grace_ms = cancel_grace_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// How long to keep reading worker output after the process exits.
    /// Follows the cancel grace period but never drops below
    /// [`MIN_OUTPUT_DRAIN_MS`].
    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms.max(MIN_OUTPUT_DRAIN_MS))
    }
}

/// Thresholds for pruning finished jobs and their artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Finished jobs older than this are removed
    pub max_age_secs: u64,
    /// Upper bound on the number of job records kept
    pub max_jobs: usize,
    /// Period of the background sweep
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 24 * 60 * 60,
            max_jobs: 200,
            sweep_interval_secs: 600,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of simultaneously running jobs
    pub max_concurrency: usize,
    /// Directory generated drawings are written into
    pub output_dir: PathBuf,
    /// Snapshot file; persistence is disabled when unset
    pub snapshot_path: Option<PathBuf>,
    /// Prefix for the download URL of completed jobs
    pub download_url_prefix: String,
    /// Safety-net dispatch period, catches work recovered after a restart
    pub dispatch_interval_ms: u64,
    /// Capacity of the request channel into the orchestrator task
    pub request_channel_capacity: usize,
    pub worker: WorkerConfig,
    pub retention: RetentionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            output_dir: PathBuf::from("outputs"),
            snapshot_path: None,
            download_url_prefix: "/api/jobs".to_string(),
            dispatch_interval_ms: 5_000,
            request_channel_capacity: 256,
            worker: WorkerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    pub fn download_url_for(&self, job_id: &Uuid) -> String {
        format!(
            "{}/{}/download",
            self.download_url_prefix.trim_end_matches('/'),
            job_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.program, PathBuf::from("python3"));
        assert_eq!(cfg.args, vec!["generate_dxf.py".to_string()]);
        assert_eq!(cfg.timeout(), Duration::from_secs(300));
        assert_eq!(cfg.cancel_grace(), Duration::from_secs(5));
    }

    #[test]
    fn worker_config_builders() {
        let cfg = WorkerConfig::new("sh", vec!["-c".to_string(), "true".to_string()])
            .with_timeout_ms(1000)
            .with_cancel_grace_ms(200);
        assert_eq!(cfg.program, PathBuf::from("sh"));
        assert_eq!(cfg.args.len(), 2);
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(cfg.cancel_grace_ms, 200);
    }

    #[test]
    fn retention_config_default() {
        let cfg = RetentionConfig::default();
        assert_eq!(cfg.max_age(), Duration::from_secs(86_400));
        assert_eq!(cfg.max_jobs, 200);
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(600));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let retention = RetentionConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(retention.sweep_interval(), Duration::from_secs(1));

        let cfg = OrchestratorConfig {
            dispatch_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(cfg.dispatch_interval(), Duration::from_millis(1));

        let worker = WorkerConfig::default().with_cancel_grace_ms(0);
        assert_eq!(worker.cancel_grace(), Duration::ZERO);
        assert_eq!(
            worker.output_drain(),
            Duration::from_millis(MIN_OUTPUT_DRAIN_MS)
        );
        let worker = worker.with_cancel_grace_ms(2_000);
        assert_eq!(worker.output_drain(), Duration::from_secs(2));
    }

    #[test]
    fn orchestrator_config_default() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_concurrency, 2);
        assert_eq!(cfg.output_dir, PathBuf::from("outputs"));
        assert!(cfg.snapshot_path.is_none());
        assert_eq!(cfg.dispatch_interval(), Duration::from_secs(5));
    }

    #[test]
    fn orchestrator_config_builders() {
        let cfg = OrchestratorConfig::new("/tmp/out")
            .with_max_concurrency(4)
            .with_snapshot_path("/tmp/state.json");
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(cfg.snapshot_path, Some(PathBuf::from("/tmp/state.json")));
    }

    #[test]
    fn download_url_strips_trailing_slash() {
        let id = Uuid::nil();
        let mut cfg = OrchestratorConfig::default();
        assert_eq!(
            cfg.download_url_for(&id),
            format!("/api/jobs/{}/download", id)
        );
        cfg.download_url_prefix = "https://example.com/files/".to_string();
        assert_eq!(
            cfg.download_url_for(&id),
            format!("https://example.com/files/{}/download", id)
        );
    }

    #[test]
    fn config_serde_roundtrip() {
        let cfg = OrchestratorConfig::new("/data/out").with_snapshot_path("/data/state.json");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
