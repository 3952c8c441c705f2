use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mapcad_jobs::config::{OrchestratorConfig, RetentionConfig, WorkerConfig};
use mapcad_jobs::metrics::{MetricsAggregator, MetricsSnapshot};
use mapcad_jobs::persistence::{PersistenceManager, Snapshot};
use mapcad_jobs::retention::RetentionManager;
use mapcad_jobs::scheduler::{GenerationPayload, GeoBounds, Job, JobStatus, JobStore, QualityTier};
use mapcad_jobs::shutdown::install_shutdown_handler;
use mapcad_jobs::worker::JobExecutor;
use mapcad_jobs::Orchestrator;

const SNAPSHOT_FILE: &str = "snapshot.json";
const OUTPUT_DIR: &str = "outputs";
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "mapcad-jobs")]
#[command(version)]
#[command(about = "Job orchestrator for DXF map generation")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    state: StateArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Generate a DXF map and wait for the job to finish
    Generate(GenerateArgs),

    /// Inspect recorded jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },

    /// Show aggregated metrics
    Metrics,

    /// Prune finished jobs and their artifacts
    Sweep(SweepArgs),
}

#[derive(Parser, Debug)]
struct StateArgs {
    /// Directory holding the snapshot file and generated artifacts
    #[arg(long, global = true, default_value = ".mapcad")]
    state_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,
}

impl StateArgs {
    fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    fn output_dir(&self) -> PathBuf {
        self.state_dir.join(OUTPUT_DIR)
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Generate Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Center latitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    /// Center longitude in degrees
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    /// Radius around the center in meters
    #[arg(long, allow_hyphen_values = true)]
    radius: f64,

    /// Quality tier: draft, standard or high
    #[arg(long, default_value = "standard")]
    quality: QualityTier,

    /// Fail instead of falling back to degraded data
    #[arg(long)]
    strict: bool,

    /// Clip bounds as "min_lat,min_lon,max_lat,max_lon"
    #[arg(long, allow_hyphen_values = true)]
    bounds: Option<GeoBounds>,

    /// Worker program to execute
    #[arg(long, default_value = "python3")]
    worker: PathBuf,

    /// Leading arguments passed to the worker (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "generate_dxf.py")]
    worker_args: Vec<String>,

    /// Worker timeout in milliseconds
    #[arg(long, default_value = "300000")]
    timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL on cancellation
    #[arg(long, default_value = "5000")]
    cancel_grace_ms: u64,

    /// Maximum number of concurrently running workers
    #[arg(long, default_value = "2")]
    max_concurrency: usize,
}

// =============================================================================
// Jobs Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobsCommands {
    /// List recorded jobs
    List {
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Show the oldest jobs first
        #[arg(long)]
        oldest_first: bool,
    },

    /// Show the full record of one job
    Status {
        /// Job ID
        job_id: Uuid,
    },
}

#[derive(Parser, Debug)]
struct SweepArgs {
    /// Remove finished jobs older than this many seconds
    #[arg(long, default_value = "86400")]
    max_age_secs: u64,

    /// Keep at most this many jobs
    #[arg(long, default_value = "200")]
    max_jobs: usize,
}

// =============================================================================
// Generate
// =============================================================================

async fn run_generate(
    state: &StateArgs,
    args: GenerateArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut payload =
        GenerationPayload::new(args.lat, args.lon, args.radius).with_quality(args.quality);
    payload = payload.with_strict(args.strict);
    if let Some(bounds) = args.bounds {
        payload = payload.with_bounds(bounds);
    }

    let worker = WorkerConfig::new(args.worker, args.worker_args)
        .with_timeout_ms(args.timeout_ms)
        .with_cancel_grace_ms(args.cancel_grace_ms);
    let config = OrchestratorConfig::new(state.output_dir())
        .with_max_concurrency(args.max_concurrency)
        .with_snapshot_path(state.snapshot_path())
        .with_worker(worker.clone());

    let shutdown = install_shutdown_handler();
    // The orchestrator outlives the first Ctrl-C so the cancellation lands
    let stop = CancellationToken::new();
    let (handle, task) =
        Orchestrator::start(config, Arc::new(JobExecutor::new(worker)), stop.clone()).await;

    let receipt = handle.submit(payload).await?;
    tracing::info!(job_id = %receipt.job_id, "Waiting for job");

    let mut cancel_sent = false;
    let job = loop {
        let job = handle.status(receipt.job_id).await?;
        if job.status.is_terminal() {
            break job;
        }
        tokio::select! {
            _ = shutdown.cancelled(), if !cancel_sent => {
                eprintln!("Cancelling job {} (press Ctrl-C again to exit now)", receipt.job_id);
                handle.cancel(receipt.job_id).await?;
                cancel_sent = true;
            }
            _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
        }
    };

    stop.cancel();
    drop(handle);
    task.await?;

    print_job(&job, &state.output)?;
    if job.status != JobStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Snapshot Views
// =============================================================================

async fn load_snapshot(state: &StateArgs) -> Result<Option<Snapshot>, Box<dyn std::error::Error>> {
    let manager = PersistenceManager::new(state.snapshot_path());
    Ok(manager.load().await?)
}

fn store_from(output_dir: &Path, snapshot: Option<Snapshot>) -> JobStore {
    let jobs = snapshot.map(|s| s.jobs).unwrap_or_default();
    JobStore::from_jobs(output_dir, jobs)
}

async fn handle_jobs_list(
    state: &StateArgs,
    limit: usize,
    oldest_first: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = store_from(&state.output_dir(), load_snapshot(state).await?);
    let jobs = store.list(limit, !oldest_first);

    match state.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<9} {:<20} ERROR",
                "JOB ID", "STATUS", "QUALITY", "CREATED"
            );
            println!("{}", "-".repeat(90));
            for job in &jobs {
                let error = job.error.as_deref().unwrap_or("-");
                let error_display = match error.char_indices().nth(30) {
                    Some((idx, _)) => format!("{}...", &error[..idx]),
                    None => error.to_string(),
                };
                println!(
                    "{:<38} {:<10} {:<9} {:<20} {}",
                    job.id,
                    job.status,
                    job.quality,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    error_display
                );
            }
            println!();
            println!("Showing {} of {} jobs", jobs.len(), store.len());
        }
    }
    Ok(())
}

async fn handle_jobs_status(
    state: &StateArgs,
    job_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = store_from(&state.output_dir(), load_snapshot(state).await?);
    let job = store.get(&job_id)?;
    print_job(job, &state.output)
}

fn print_job(job: &Job, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(job)?);
        }
        OutputFormat::Table => {
            println!("Job ID:       {}", job.id);
            println!("Status:       {}", job.status);
            println!(
                "Request:      lat={} lon={} radius={}m quality={}{}",
                job.payload.lat,
                job.payload.lon,
                job.payload.radius_m,
                job.payload.quality,
                if job.payload.strict { " strict" } else { "" }
            );
            println!("Created:      {}", job.created_at.to_rfc3339());
            if let Some(started) = job.started_at {
                println!("Started:      {}", started.to_rfc3339());
            }
            if let Some(finished) = job.finished_at {
                println!("Finished:     {}", finished.to_rfc3339());
            }
            if let Some(ms) = job.elapsed_ms {
                println!("Elapsed:      {}ms", ms);
            }
            if job.cancel_requested {
                println!("Cancel:       requested");
            }
            if job.status == JobStatus::Completed {
                println!("Artifact:     {}", job.output_path.display());
            }
            if let Some(url) = &job.download_url {
                println!("Download:     {}", url);
            }
            if let Some(result) = &job.result {
                println!("Result:       {}", result);
            }
            if let Some(error) = &job.error {
                match job.error_kind {
                    Some(kind) => println!("Error ({}):", kind),
                    None => println!("Error:"),
                }
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_metrics(state: &StateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load_snapshot(state).await?;
    let metrics: MetricsSnapshot = match snapshot {
        Some(snapshot) => {
            let store = JobStore::from_jobs(state.output_dir(), snapshot.jobs);
            MetricsAggregator::from_counters(snapshot.metrics).snapshot(
                store.count(JobStatus::Queued),
                store.count(JobStatus::Running),
            )
        }
        None => MetricsAggregator::new().snapshot(0, 0),
    };

    match state.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        OutputFormat::Table => {
            let c = &metrics.counters;
            println!("Metrics");
            println!("{}", "=".repeat(40));
            println!("Requests:      {}", c.request_count);
            println!("Created:       {}", c.jobs_created);
            println!("Completed:     {}", c.jobs_completed);
            println!("Failed:        {}", c.jobs_failed);
            println!("Cancelled:     {}", c.jobs_cancelled);
            println!("Queue depth:   {}", metrics.queue_depth);
            println!("Active:        {}", metrics.active_jobs);
            println!("Avg duration:  {:.1}ms", metrics.avg_duration_ms);
            println!();
            println!("By quality:");
            for (quality, count) in &c.by_quality {
                println!("  {:<10} {}", quality, count);
            }
            println!("By source:");
            for (source, count) in &c.by_source {
                println!("  {:<10} {}", source, count);
            }
            println!("By failure:");
            for (kind, count) in &c.by_failure {
                println!("  {:<10} {}", kind, count);
            }
        }
    }
    Ok(())
}

async fn handle_sweep(state: &StateArgs, args: SweepArgs) -> Result<(), Box<dyn std::error::Error>> {
    let manager = PersistenceManager::new(state.snapshot_path());
    let Some(mut snapshot) = manager.load().await? else {
        println!("No snapshot found at {}", manager.path().display());
        return Ok(());
    };

    let retention = RetentionManager::new(RetentionConfig {
        max_age_secs: args.max_age_secs,
        max_jobs: args.max_jobs,
        ..RetentionConfig::default()
    });
    let mut store = JobStore::from_jobs(state.output_dir(), std::mem::take(&mut snapshot.jobs));
    let report = retention.sweep(&mut store, chrono::Utc::now()).await;

    if !report.removed.is_empty() {
        snapshot.jobs = store.all_jobs().into_iter().cloned().collect();
        snapshot.persisted_at = chrono::Utc::now();
        manager.save(&snapshot).await?;
    }

    match state.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("Removed {} jobs", report.removed.len());
            println!("Artifacts deleted: {}", report.artifacts_deleted);
            if report.artifact_errors > 0 {
                println!("Artifact errors:   {}", report.artifact_errors);
            }
            println!("Remaining jobs:    {}", store.len());
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Generate(generate_args) => {
            run_generate(&args.state, generate_args).await?;
        }
        Commands::Jobs { command } => match command {
            JobsCommands::List {
                limit,
                oldest_first,
            } => {
                handle_jobs_list(&args.state, limit, oldest_first).await?;
            }
            JobsCommands::Status { job_id } => {
                handle_jobs_status(&args.state, job_id).await?;
            }
        },
        Commands::Metrics => {
            handle_metrics(&args.state).await?;
        }
        Commands::Sweep(sweep_args) => {
            handle_sweep(&args.state, sweep_args).await?;
        }
    }

    Ok(())
}
