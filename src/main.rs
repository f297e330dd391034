use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use imgfleet::config::{BatchMode, DispatchConfig, QueuePolicy, WorkerConfig};
use imgfleet::coordinator::Coordinator;
use imgfleet::scheduler::{BatchStatus, BatchView, JobSpec, JobStatus, TransformKind};
use imgfleet::shutdown::install_shutdown_handler;
use imgfleet::worker::{HttpTransport, WorkerEndpoint, WorkerTransport};
use imgfleet::{FleetError, JsonLinesSink, RecordSink, TracingSink};

#[derive(Parser, Debug)]
#[command(name = "imgfleet")]
#[command(version)]
#[command(about = "Dispatch image-processing jobs across a pool of workers")]
#[command(propagate_version = true)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a job manifest against a set of workers and wait for the results
    Run(RunArgs),

    /// Probe workers once and report which ones answer
    Probe {
        /// Worker as id=url@capacity (repeatable)
        #[arg(long = "worker", short = 'w', required = true)]
        workers: Vec<WorkerConfig>,

        /// Probe timeout in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// List the supported transformations
    Transforms,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Worker as id=url@capacity (repeatable)
    #[arg(long = "worker", short = 'w', required = true)]
    workers: Vec<WorkerConfig>,

    /// JSON file holding an array of jobs: {"kind", "parameters", "input_ref"}
    #[arg(long, short = 'm')]
    manifest: PathBuf,

    /// Report partial success instead of failing the whole batch
    #[arg(long)]
    best_effort: bool,

    /// Keep jobs of the same batch together in the queue
    #[arg(long)]
    batch_grouped: bool,

    /// Failed attempts allowed per job before it is marked failed
    #[arg(long, default_value = "3")]
    retry_limit: u32,

    /// Interval between health probes
    #[arg(long, default_value = "5000")]
    probe_interval_ms: u64,

    /// Timeout for a single health probe
    #[arg(long, default_value = "2000")]
    probe_timeout_ms: u64,

    /// Missed probes before a worker is declared dead
    #[arg(long, default_value = "3")]
    missed_probes: u32,

    /// Base dispatch timeout, scaled by transformation cost
    #[arg(long, default_value = "30000")]
    dispatch_timeout_ms: u64,

    /// Scheduler backoff when every worker is busy
    #[arg(long, default_value = "50")]
    backoff_base_ms: u64,

    #[arg(long, default_value = "2000")]
    backoff_cap_ms: u64,

    /// Append terminal job and batch records to this file as JSON lines
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "3600")]
    wait_timeout_secs: u64,

    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl RunArgs {
    fn dispatch_config(&self) -> DispatchConfig {
        let mut config = DispatchConfig::default()
            .with_retry_limit(self.retry_limit)
            .with_probe_interval_ms(self.probe_interval_ms)
            .with_probe_timeout_ms(self.probe_timeout_ms)
            .with_missed_probe_threshold(self.missed_probes)
            .with_dispatch_timeout_ms(self.dispatch_timeout_ms)
            .with_backoff_ms(self.backoff_base_ms, self.backoff_cap_ms);
        if self.best_effort {
            config = config.with_batch_mode(BatchMode::BestEffort);
        }
        if self.batch_grouped {
            config = config.with_queue_policy(QueuePolicy::BatchGrouped);
        }
        config
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ProbeOutput {
    worker_id: String,
    address: String,
    alive: bool,
    active_jobs: Option<u32>,
    error: Option<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Commands::Run(run) => run_manifest(run).await,
        Commands::Probe {
            workers,
            timeout_ms,
            output,
        } => probe_workers(workers, Duration::from_millis(timeout_ms), &output).await,
        Commands::Transforms => {
            for kind in TransformKind::ALL {
                println!("{}", kind);
            }
            Ok(())
        }
    }
}

// =============================================================================
// Run
// =============================================================================

async fn run_manifest(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = tokio::fs::read_to_string(&args.manifest).await?;
    let specs: Vec<JobSpec> = serde_json::from_str(&manifest)?;
    if specs.is_empty() {
        return Err(FleetError::EmptyBatch.into());
    }

    let audit = match &args.audit_log {
        Some(path) => Some(Arc::new(JsonLinesSink::open(path)?)),
        None => None,
    };
    let sink: Arc<dyn RecordSink> = match &audit {
        Some(audit) => audit.clone(),
        None => Arc::new(TracingSink),
    };
    let config = args.dispatch_config();
    let transport = HttpTransport::new(config.probe_timeout())?;
    let coordinator = Coordinator::start_with_sink(config, Arc::new(transport), sink)?;

    for worker in &args.workers {
        coordinator
            .register_worker(&worker.id, &worker.address, worker.capacity)
            .await?;
    }

    let shutdown = install_shutdown_handler();
    let batch_id = coordinator.submit_batch(specs, None).await?;
    let wait = coordinator.wait_for_batch(batch_id, Duration::from_secs(args.wait_timeout_secs));

    let result = tokio::select! {
        result = wait => result,
        _ = shutdown.cancelled() => {
            let cancelled = coordinator.cancel_batch(batch_id).await?;
            tracing::warn!(batch_id = %batch_id, cancelled, "Interrupted, cancelling outstanding jobs");
            coordinator.batch_status(batch_id).await
        }
    };

    // A failed all-or-nothing batch is decided before its last jobs finish.
    let result = match result {
        Ok(view)
            if view.status.is_terminal()
                && view.jobs.iter().any(|j| !j.status.is_terminal()) =>
        {
            let cancelled = coordinator.cancel_batch(batch_id).await?;
            tracing::warn!(
                batch_id = %batch_id,
                cancelled,
                status = %view.status,
                "Batch decided, cancelling remaining jobs"
            );
            coordinator.batch_status(batch_id).await
        }
        other => other,
    };
    coordinator.shutdown().await;
    if let Some(audit) = &audit {
        audit.flush().await;
    }

    let view = match result {
        Ok(view) => view,
        Err(FleetError::WaitTimeout(_)) => {
            eprintln!(
                "Error: batch did not finish within {}s",
                args.wait_timeout_secs
            );
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Table => print_batch(&view),
    }

    if !matches!(view.status, BatchStatus::Succeeded | BatchStatus::PartialSuccess { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_batch(view: &BatchView) {
    println!("Batch ID: {}", view.id);
    println!("Mode:     {}", view.mode);
    println!("Status:   {}", view.status);
    println!(
        "Jobs:     {} succeeded, {} failed, {} cancelled, {} total",
        view.count(JobStatus::Succeeded),
        view.count(JobStatus::Failed),
        view.count(JobStatus::Cancelled),
        view.jobs.len()
    );
    println!();
    println!(
        "{:<36}  {:<10}  {:<10}  {:<8}  {:<10}  RESULT",
        "JOB ID", "KIND", "STATUS", "ATTEMPTS", "WORKER"
    );
    println!("{}", "-".repeat(100));
    for job in &view.jobs {
        let result = match (&job.output_ref, &job.error) {
            (Some(output), _) => output.clone(),
            (None, Some(error)) => error.to_string(),
            (None, None) => String::new(),
        };
        println!(
            "{:<36}  {:<10}  {:<10}  {:<8}  {:<10}  {}",
            job.id,
            job.kind,
            job.status,
            job.attempts,
            job.assigned_worker.as_deref().unwrap_or("-"),
            result
        );
    }
}

// =============================================================================
// Probe
// =============================================================================

async fn probe_workers(
    workers: Vec<WorkerConfig>,
    timeout: Duration,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = HttpTransport::new(timeout)?;
    let mut results = Vec::with_capacity(workers.len());

    for worker in workers {
        let endpoint = WorkerEndpoint {
            id: worker.id.clone(),
            address: worker.address.clone(),
        };
        let outcome = tokio::time::timeout(timeout, transport.probe(&endpoint)).await;
        let (alive, active_jobs, error) = match outcome {
            Ok(Ok(reply)) => (true, Some(reply.active_jobs), None),
            Ok(Err(e)) => (false, None, Some(e.to_string())),
            Err(_) => (false, None, Some("timed out".to_string())),
        };
        results.push(ProbeOutput {
            worker_id: worker.id,
            address: worker.address,
            alive,
            active_jobs,
            error,
        });
    }

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Table => {
            println!("{:<16}  {:<32}  {:<6}  {:<6}  ERROR", "WORKER", "ADDRESS", "ALIVE", "JOBS");
            println!("{}", "-".repeat(80));
            for r in &results {
                println!(
                    "{:<16}  {:<32}  {:<6}  {:<6}  {}",
                    r.worker_id,
                    r.address,
                    if r.alive { "yes" } else { "no" },
                    r.active_jobs.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    r.error.as_deref().unwrap_or("")
                );
            }
        }
    }

    if results.iter().any(|r| !r.alive) {
        std::process::exit(1);
    }
    Ok(())
}
