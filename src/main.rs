//! # FHIR Lake Sync Entry Point
//!
//! Runs the trigger scheduler and the job worker, or inspects and cancels
//! runs from the command line.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fhir_lake_sync::{
    config::{AppConfig, ConfigLoader},
    convert::NdjsonConverter,
    db,
    orchestrator::OrchestratorJob,
    poll::PollPolicy,
    processing::ProcessingJob,
    repositories::{JobRepository, MetadataRepository},
    retry::RetryPolicy,
    scheduler::{SchedulerSettings, TriggerScheduler},
    source::FhirApiDataSource,
    storage::LocalLakeStorage,
    telemetry,
    worker::{JobWorker, WorkerConfig},
};

#[derive(Debug, Parser)]
#[command(name = "fhir-lake-sync", version, about = "Incremental FHIR to data lake extraction")]
struct Cli {
    /// Worker identity recorded on claimed jobs (defaults to the scheduler instance id)
    #[arg(long, global = true)]
    worker_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scheduler and worker in one process
    Run,
    /// Trigger scheduler only
    Scheduler {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
    /// Job worker only
    Worker,
    /// Print the current trigger and the job counts of its run
    Status,
    /// Request cancellation of every job of a run
    Cancel {
        #[arg(long)]
        group: i64,
    },
}

struct Services {
    jobs: JobRepository,
    metadata: MetadataRepository,
    scheduler: TriggerScheduler,
}

impl Services {
    fn new(config: &AppConfig, db: DatabaseConnection) -> Self {
        let jobs = JobRepository::new(db.clone(), config.job.version_conflict_retries);
        let metadata = MetadataRepository::new(db, config.job.version_conflict_retries);
        let scheduler = TriggerScheduler::new(
            jobs.clone(),
            metadata.clone(),
            SchedulerSettings::from_config(config),
        );
        Self {
            jobs,
            metadata,
            scheduler,
        }
    }

    fn worker(&self, config: &AppConfig, worker_id: String) -> Result<JobWorker> {
        let storage = Arc::new(LocalLakeStorage::new(config.storage.root_dir.clone()));
        let source = Arc::new(
            FhirApiDataSource::new(&config.source).context("building FHIR data source")?,
        );
        let converter = Arc::new(NdjsonConverter::new(config.source.resource_types.iter()));

        let processing = Arc::new(ProcessingJob::new(
            source,
            converter,
            storage.clone(),
            RetryPolicy::from(&config.retry),
            config.job.checkpoint_record_count,
        ));
        let orchestrator = Arc::new(OrchestratorJob::new(
            self.jobs.clone(),
            self.metadata.clone(),
            storage,
            PollPolicy::every(Duration::from_secs(config.job.orchestrator_poll_interval_seconds)),
        ));

        Ok(JobWorker::new(
            self.jobs.clone(),
            processing,
            orchestrator,
            WorkerConfig::from_job_config(&config.job, worker_id),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    let db = db::connect_and_migrate(&config)
        .await
        .context("initializing job store")?;
    let services = Services::new(&config, db);
    let worker_id = cli
        .worker_id
        .clone()
        .unwrap_or_else(|| config.scheduler.instance_id.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_ctrl_c(shutdown.clone()));

    match cli.command {
        Command::Run => {
            let worker = services.worker(&config, worker_id)?;
            let worker_shutdown = shutdown.clone();
            let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

            services.scheduler.run(shutdown.clone()).await;
            if let Err(err) = worker_task.await {
                error!(error = %err, "Worker task ended abnormally");
            }
        }
        Command::Scheduler { once: true } => {
            let outcome = services.scheduler.tick(chrono::Utc::now()).await?;
            info!(?outcome, "Scheduler tick finished");
        }
        Command::Scheduler { once: false } => services.scheduler.run(shutdown).await,
        Command::Worker => services.worker(&config, worker_id)?.run(shutdown).await,
        Command::Status => print_status(&config, &services).await?,
        Command::Cancel { group } => {
            let touched = services
                .jobs
                .cancel_jobs_by_group(&config.job.queue_type, group, None)
                .await
                .with_context(|| format!("cancelling group {group}"))?;
            println!("Cancellation requested for {touched} job(s) in group {group}");
        }
    }

    Ok(())
}

async fn print_status(config: &AppConfig, services: &Services) -> Result<()> {
    let Some(state) = services.scheduler.current_state().await? else {
        println!("No trigger has been scheduled yet");
        return Ok(());
    };

    println!("Watermark: {}", state.last_scheduled_timestamp.to_rfc3339());
    let Some(trigger) = state.current_trigger else {
        return Ok(());
    };

    println!(
        "Trigger {}: {} {}",
        trigger.trigger_sequence_id,
        trigger.trigger_status.as_str(),
        trigger.window()
    );
    if let Some(error) = &trigger.error {
        println!("  error: {error}");
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for job in services
        .jobs
        .get_jobs_by_group(&config.job.queue_type, trigger.trigger_sequence_id)
        .await?
    {
        *counts
            .entry(format!("{}/{}", job.job_type(), job.status))
            .or_default() += 1;
    }
    for (key, count) in counts {
        println!("  {key}: {count}");
    }

    Ok(())
}

async fn wait_for_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => warn!(error = %err, "Failed to listen for ctrl-c; shutting down"),
    }
    shutdown.cancel();
}
