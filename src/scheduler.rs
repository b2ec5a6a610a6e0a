//! # Trigger Scheduler
//!
//! Periodic driver that turns wall-clock time into orchestrator runs. Each
//! cycle either starts a trigger for the next unscheduled window
//! `[last_scheduled_timestamp, now - safety_lag)` or follows the running
//! trigger's orchestrator job to a terminal state. The watermark only
//! advances when a trigger completes, so a failed window is retried by the
//! next trigger.
//!
//! Only the holder of the `scheduler_trigger` lease may read-modify-write the
//! trigger record; the lease is taken per tick and released on every exit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{JobError, StoreError};
use crate::jobs::{DataPeriod, JobDefinition, JobInfo, JobStatus, OrchestratorDefinition};
use crate::poll::{Poll, PollError, PollPolicy, poll_until};
use crate::repositories::{JobRepository, LeaseRepository, MetadataRepository, Versioned};

pub const SCHEDULER_PARTITION: &str = "scheduler";
pub const CURRENT_TRIGGER_ROW: &str = "current_trigger";
pub const TRIGGER_LEASE_RESOURCE: &str = "scheduler_trigger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Running,
    Completed,
    Failed,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Running => "running",
            TriggerStatus::Completed => "completed",
            TriggerStatus::Failed => "failed",
        }
    }
}

/// The most recent trigger and the orchestrator run it tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentTrigger {
    pub trigger_sequence_id: i64,
    pub trigger_status: TriggerStatus,
    pub trigger_start_time: DateTime<Utc>,
    pub trigger_end_time: DateTime<Utc>,
    pub orchestrator_job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CurrentTrigger {
    pub fn window(&self) -> DataPeriod {
        DataPeriod {
            start: self.trigger_start_time,
            end: self.trigger_end_time,
        }
    }
}

/// Persisted scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetadata {
    /// Exclusive end of everything completed triggers have covered.
    pub last_scheduled_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub current_trigger: Option<CurrentTrigger>,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another instance holds the trigger lease.
    LeaseUnavailable,
    /// Nothing is running and the next window is empty.
    NoWindow,
    Started { sequence_id: i64, window: DataPeriod },
    Waiting { sequence_id: i64, status: JobStatus },
    Completed { sequence_id: i64, watermark: DateTime<Utc> },
    Failed { sequence_id: i64, error: String },
}

impl TickOutcome {
    /// True once the tick left nothing in flight.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TickOutcome::NoWindow | TickOutcome::Completed { .. } | TickOutcome::Failed { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub queue_type: String,
    pub instance_id: String,
    pub resource_types: Vec<String>,
    pub max_range_hours: u32,
    pub tick_interval: Duration,
    pub safety_lag: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub lease_duration: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            queue_type: config.job.queue_type.clone(),
            instance_id: config.scheduler.instance_id.clone(),
            resource_types: config.source.resource_types.clone(),
            max_range_hours: config.job.max_range_hours,
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_seconds),
            safety_lag: Duration::from_secs(config.scheduler.safety_lag_seconds),
            start_time: config.scheduler.start_time,
            end_time: config.scheduler.end_time,
            lease_duration: Duration::from_secs(config.scheduler.lease_duration_seconds),
        }
    }
}

pub struct TriggerScheduler {
    jobs: JobRepository,
    metadata: MetadataRepository,
    leases: LeaseRepository,
    settings: SchedulerSettings,
}

impl TriggerScheduler {
    pub fn new(jobs: JobRepository, metadata: MetadataRepository, settings: SchedulerSettings) -> Self {
        let leases = LeaseRepository::new(metadata.clone());
        Self {
            jobs,
            metadata,
            leases,
            settings,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all, fields(instance_id = %self.settings.instance_id))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting trigger scheduler");

        loop {
            let tick_started = Instant::now();
            match self.tick(Utc::now()).await {
                Ok(outcome) => debug!(?outcome, "Scheduler tick completed"),
                Err(err) => error!(error = %err, "Scheduler tick failed"),
            }
            histogram!("scheduler_tick_duration_ms").record(tick_started.elapsed().as_secs_f64() * 1_000.0);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Trigger scheduler shutdown requested");
                    break;
                }
                _ = sleep(self.settings.tick_interval) => {}
            }
        }

        info!("Trigger scheduler stopped");
    }

    /// Ticks on `policy` until a trigger settles (or there is nothing to do).
    pub async fn run_cycle(
        &self,
        policy: &PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome, JobError> {
        let outcome = poll_until(policy, cancel, || async {
            let outcome = self.tick(Utc::now()).await?;
            Ok::<_, JobError>(if outcome.is_settled() {
                Poll::Ready(outcome)
            } else {
                Poll::Pending
            })
        })
        .await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(PollError::Cancelled) => Err(JobError::Cancelled),
            Err(PollError::TimedOut(waited)) => Err(JobError::retriable(format!(
                "trigger still running after {waited:?}"
            ))),
            Err(PollError::Failed(err)) => Err(err),
        }
    }

    /// One scheduling step at `now`, under the trigger lease.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, JobError> {
        let Some(guard) = self
            .leases
            .acquire_guard(
                TRIGGER_LEASE_RESOURCE,
                &self.settings.instance_id,
                self.settings.lease_duration,
            )
            .await?
        else {
            debug!("Trigger lease held by another instance");
            return Ok(TickOutcome::LeaseUnavailable);
        };

        let outcome = self.tick_with_lease(now).await;

        if let Err(err) = guard.release().await {
            warn!(error = %err, "Failed to release trigger lease");
        }
        outcome
    }

    /// The stored scheduler state, if any cycle has run yet.
    pub async fn current_state(&self) -> Result<Option<SchedulerMetadata>, StoreError> {
        Ok(self
            .metadata
            .get::<SchedulerMetadata>(SCHEDULER_PARTITION, CURRENT_TRIGGER_ROW)
            .await?
            .map(|stored| stored.value))
    }

    async fn tick_with_lease(&self, now: DateTime<Utc>) -> Result<TickOutcome, JobError> {
        let stored = self
            .metadata
            .get::<SchedulerMetadata>(SCHEDULER_PARTITION, CURRENT_TRIGGER_ROW)
            .await?;
        let (state, version) = match stored {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => (
                SchedulerMetadata {
                    last_scheduled_timestamp: self.settings.start_time,
                    current_trigger: None,
                },
                None,
            ),
        };

        match &state.current_trigger {
            Some(trigger) if trigger.trigger_status == TriggerStatus::Running => {
                let trigger = trigger.clone();
                self.follow_trigger(state, version, trigger).await
            }
            _ => self.start_trigger(now, state, version).await,
        }
    }

    async fn start_trigger(
        &self,
        now: DateTime<Utc>,
        mut state: SchedulerMetadata,
        version: Option<i64>,
    ) -> Result<TickOutcome, JobError> {
        let Some(window) = self.next_window(now, state.last_scheduled_timestamp) else {
            return Ok(TickOutcome::NoWindow);
        };

        let sequence_id = state
            .current_trigger
            .as_ref()
            .map_or(1, |previous| previous.trigger_sequence_id + 1);

        // Record the trigger before enqueueing so a crash in between is
        // picked up by the running-trigger path.
        state.current_trigger = Some(CurrentTrigger {
            trigger_sequence_id: sequence_id,
            trigger_status: TriggerStatus::Running,
            trigger_start_time: window.start,
            trigger_end_time: window.end,
            orchestrator_job_id: None,
            error: None,
        });
        let version = self.save(&state, version).await?;

        let job = self.enqueue_orchestrator(sequence_id, window).await?;
        if let Some(trigger) = state.current_trigger.as_mut() {
            trigger.orchestrator_job_id = Some(job.id);
        }
        self.save(&state, Some(version)).await?;

        counter!("scheduler_triggers_total", "status" => TriggerStatus::Running.as_str()).increment(1);
        info!(
            trigger_sequence_id = sequence_id,
            window = %window,
            orchestrator_job_id = %job.id,
            "Trigger started"
        );
        Ok(TickOutcome::Started { sequence_id, window })
    }

    async fn follow_trigger(
        &self,
        mut state: SchedulerMetadata,
        version: Option<i64>,
        mut trigger: CurrentTrigger,
    ) -> Result<TickOutcome, JobError> {
        let sequence_id = trigger.trigger_sequence_id;

        let job = match trigger.orchestrator_job_id {
            Some(job_id) => self.jobs.get_job(job_id).await?,
            None => {
                let job = self.enqueue_orchestrator(sequence_id, trigger.window()).await?;
                trigger.orchestrator_job_id = Some(job.id);
                state.current_trigger = Some(trigger.clone());
                self.save(&state, version).await?;
                info!(trigger_sequence_id = sequence_id, orchestrator_job_id = %job.id, "Orchestrator job re-created for running trigger");
                return Ok(TickOutcome::Waiting {
                    sequence_id,
                    status: job.status,
                });
            }
        };

        match job.status {
            JobStatus::Completed => {
                trigger.trigger_status = TriggerStatus::Completed;
                trigger.error = None;
                state.last_scheduled_timestamp = trigger.trigger_end_time;
                state.current_trigger = Some(trigger.clone());
                self.save(&state, version).await?;

                counter!("scheduler_triggers_total", "status" => TriggerStatus::Completed.as_str())
                    .increment(1);
                info!(
                    trigger_sequence_id = sequence_id,
                    watermark = %trigger.trigger_end_time,
                    "Trigger completed"
                );
                Ok(TickOutcome::Completed {
                    sequence_id,
                    watermark: trigger.trigger_end_time,
                })
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                let error = describe_failure(&job);
                trigger.trigger_status = TriggerStatus::Failed;
                trigger.error = Some(error.clone());
                state.current_trigger = Some(trigger);
                self.save(&state, version).await?;

                counter!("scheduler_triggers_total", "status" => TriggerStatus::Failed.as_str())
                    .increment(1);
                error!(
                    trigger_sequence_id = sequence_id,
                    error = %error,
                    "Trigger failed; window will be retried"
                );
                Ok(TickOutcome::Failed { sequence_id, error })
            }
            status @ (JobStatus::Created | JobStatus::Running) => {
                debug!(trigger_sequence_id = sequence_id, %status, "Trigger still running");
                Ok(TickOutcome::Waiting { sequence_id, status })
            }
        }
    }

    /// `[watermark, min(now - safety_lag, end_time))`, or `None` when empty.
    fn next_window(&self, now: DateTime<Utc>, watermark: DateTime<Utc>) -> Option<DataPeriod> {
        let lag = chrono::Duration::from_std(self.settings.safety_lag).unwrap_or(chrono::Duration::MAX);
        let mut end = now.checked_sub_signed(lag)?;
        if let Some(end_time) = self.settings.end_time {
            end = end.min(end_time);
        }
        DataPeriod::new(watermark, end).ok()
    }

    async fn enqueue_orchestrator(&self, sequence_id: i64, window: DataPeriod) -> Result<JobInfo, JobError> {
        let definition = JobDefinition::Orchestrator(OrchestratorDefinition {
            data_period: window,
            resource_types: self.settings.resource_types.clone(),
            max_range_hours: self.settings.max_range_hours,
        });

        self.jobs
            .enqueue(&self.settings.queue_type, sequence_id, &[definition], true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JobError::internal("enqueue returned no orchestrator job"))
    }

    async fn save(&self, state: &SchedulerMetadata, version: Option<i64>) -> Result<i64, StoreError> {
        match version {
            Some(version) => {
                self.metadata
                    .compare_and_swap(SCHEDULER_PARTITION, CURRENT_TRIGGER_ROW, state, version)
                    .await
            }
            None => {
                self.metadata
                    .insert(SCHEDULER_PARTITION, CURRENT_TRIGGER_ROW, state)
                    .await
            }
        }
    }
}

fn describe_failure(job: &JobInfo) -> String {
    if job.status == JobStatus::Cancelled {
        return "orchestrator job was cancelled".to_string();
    }
    job.error
        .as_ref()
        .and_then(|details| details.get("message"))
        .and_then(|message| message.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "orchestrator job failed".to_string())
}
