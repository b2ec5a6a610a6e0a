//! # Job Worker
//!
//! Hosts orchestrator and processing jobs. The worker polls the queue, claims
//! jobs while it has free permits and runs each one in its own task together
//! with a heartbeat and a progress updater. Orchestrators and processing jobs
//! draw from separate permit pools so waiting orchestrators never occupy the
//! slots their own processing jobs need.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{JobError, StoreError};
use crate::jobs::{JobInfo, JobStatus, JobType};
use crate::orchestrator::OrchestratorJob;
use crate::processing::ProcessingJob;
use crate::progress::{JobProgressSink, ProgressUpdater};
use crate::repositories::JobRepository;

/// Runtime settings of one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_type: String,
    pub worker_id: String,
    pub processing_concurrency: usize,
    pub orchestrator_concurrency: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub dequeue_interval: Duration,
    pub max_attempts_per_job: u32,
    pub progress_flush_interval: Duration,
}

impl WorkerConfig {
    pub fn from_job_config(config: &JobConfig, worker_id: impl Into<String>) -> Self {
        Self {
            queue_type: config.queue_type.clone(),
            worker_id: worker_id.into(),
            processing_concurrency: config.concurrency.max(1),
            orchestrator_concurrency: config.concurrency.max(1),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            dequeue_interval: Duration::from_millis(config.dequeue_interval_ms),
            max_attempts_per_job: config.max_attempts_per_job,
            progress_flush_interval: config.progress_flush_interval(),
        }
    }
}

/// How a hosted job ended, as far as the worker is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Requeued,
    Cancelled,
    /// Handed back to the queue on shutdown.
    Released,
    /// The worker lost ownership or could not record the outcome.
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Requeued => "requeued",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Released => "released",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Clone)]
pub struct JobWorker {
    jobs: JobRepository,
    processing: Arc<ProcessingJob>,
    orchestrator: Arc<OrchestratorJob>,
    config: Arc<WorkerConfig>,
    processing_permits: Arc<Semaphore>,
    orchestrator_permits: Arc<Semaphore>,
}

impl JobWorker {
    pub fn new(
        jobs: JobRepository,
        processing: Arc<ProcessingJob>,
        orchestrator: Arc<OrchestratorJob>,
        config: WorkerConfig,
    ) -> Self {
        let processing_permits = Arc::new(Semaphore::new(config.processing_concurrency.max(1)));
        let orchestrator_permits = Arc::new(Semaphore::new(config.orchestrator_concurrency.max(1)));
        Self {
            jobs,
            processing,
            orchestrator,
            config: Arc::new(config),
            processing_permits,
            orchestrator_permits,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Runs the dequeue loop until `shutdown` fires, then waits for the
    /// in-flight jobs to stop at their next boundary.
    #[instrument(skip_all, fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            queue = %self.config.queue_type,
            concurrency = self.config.processing_concurrency,
            "Starting job worker"
        );
        let mut running = JoinSet::new();

        while !shutdown.is_cancelled() {
            let dispatched = match self.tick(&shutdown, &mut running).await {
                Ok(dispatched) => dispatched,
                Err(err) => {
                    error!(error = %err, "Dequeue failed");
                    0
                }
            };

            while let Some(joined) = running.try_join_next() {
                if let Err(err) = joined {
                    error!(error = %err, "Job task panicked");
                }
            }

            if dispatched == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(self.config.dequeue_interval) => {}
                }
            }
        }

        info!(in_flight = running.len(), "Job worker draining");
        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Job task panicked");
            }
        }
        info!("Job worker stopped");
    }

    /// Claims as many jobs as there are free permits. Returns how many were
    /// started.
    pub async fn tick(
        &self,
        shutdown: &CancellationToken,
        running: &mut JoinSet<JobOutcome>,
    ) -> Result<usize, StoreError> {
        let mut dispatched = 0;

        for (job_type, permits) in [
            (JobType::Orchestrator, &self.orchestrator_permits),
            (JobType::Processing, &self.processing_permits),
        ] {
            while let Ok(permit) = permits.clone().try_acquire_owned() {
                let Some(job) = self
                    .jobs
                    .dequeue(
                        &self.config.queue_type,
                        &self.config.worker_id,
                        self.config.heartbeat_timeout,
                        Some(job_type),
                    )
                    .await?
                else {
                    break;
                };

                let worker = self.clone();
                let shutdown = shutdown.clone();
                running.spawn(async move { worker.host(job, shutdown, permit).await });
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    async fn host(&self, job: JobInfo, shutdown: CancellationToken, _permit: OwnedSemaphorePermit) -> JobOutcome {
        let outcome = self.run_job(job, &shutdown).await;
        counter!("jobs_completed_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    /// Runs one claimed job to an outcome and records it in the store.
    #[instrument(skip_all, fields(job_id = %job.id, group_id = job.group_id, job_type = %job.job_type()))]
    pub async fn run_job(&self, job: JobInfo, shutdown: &CancellationToken) -> JobOutcome {
        info!(attempts = job.attempts, "Job started");

        let cancel = shutdown.child_token();
        let stop_heartbeat = CancellationToken::new();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.jobs.clone(),
            job.id,
            self.config.worker_id.clone(),
            self.config.heartbeat_interval,
            cancel.clone(),
            stop_heartbeat.clone(),
            cancel_requested.clone(),
        ));

        let sink = Arc::new(JobProgressSink::new(
            self.jobs.clone(),
            job.id,
            self.config.worker_id.clone(),
        ));
        let progress = ProgressUpdater::spawn(sink, self.config.progress_flush_interval);

        let result = match job.job_type() {
            JobType::Orchestrator => self.orchestrator.execute(&job, &progress, &cancel).await,
            JobType::Processing => self.processing.execute(&job, &progress, &cancel).await,
        };

        stop_heartbeat.cancel();
        if let Err(err) = heartbeat.await {
            warn!(error = %err, "Heartbeat task ended abnormally");
        }
        if let Err(err) = progress.close().await {
            warn!(error = %err, "Final progress flush failed");
        }

        let recorded = match result {
            Ok(result) => self
                .jobs
                .complete_job(job.id, &self.config.worker_id, &result)
                .await
                .map(|_| JobOutcome::Completed),
            Err(JobError::Cancelled) if shutdown.is_cancelled() && !cancel_requested.load(Ordering::SeqCst) => {
                self.jobs
                    .release_job(job.id, &self.config.worker_id)
                    .await
                    .map(|stored| match stored.status {
                        JobStatus::Cancelled => JobOutcome::Cancelled,
                        _ => JobOutcome::Released,
                    })
            }
            Err(JobError::Cancelled) => self
                .jobs
                .cancel_job(job.id, &self.config.worker_id)
                .await
                .map(|_| JobOutcome::Cancelled),
            Err(err) => self
                .jobs
                .fail_job(
                    job.id,
                    &self.config.worker_id,
                    &err,
                    self.config.max_attempts_per_job,
                )
                .await
                .map(|stored| match stored.status {
                    JobStatus::Created => JobOutcome::Requeued,
                    JobStatus::Cancelled => JobOutcome::Cancelled,
                    _ => JobOutcome::Failed,
                }),
        };

        match recorded {
            Ok(outcome) => {
                debug!(outcome = outcome.as_str(), "Job outcome recorded");
                outcome
            }
            Err(StoreError::NotOwner { .. }) => {
                warn!("Job was reclaimed by another worker; outcome discarded");
                JobOutcome::Abandoned
            }
            Err(err) => {
                error!(error = %err, "Failed to record job outcome");
                JobOutcome::Abandoned
            }
        }
    }
}

/// Refreshes the job's heartbeat until stopped. A `false` from the store
/// (cancellation requested or ownership lost) cancels the job.
async fn heartbeat_loop(
    jobs: JobRepository,
    job_id: Uuid,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = sleep(interval) => {}
        }

        match jobs.keep_alive(job_id, &worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job_id, "Stop requested for running job");
                cancel_requested.store(true, Ordering::SeqCst);
                cancel.cancel();
                return;
            }
            Err(err) => warn!(job_id = %job_id, error = %err, "Heartbeat failed"),
        }
    }
}
