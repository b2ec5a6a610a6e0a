//! # Orchestrator Job
//!
//! Splits one overall window into `(resourceType, sub-range)` processing jobs,
//! enqueues them under the orchestrator's group and waits until every one of
//! them is terminal. Completed jobs have their staged output committed as soon
//! as they are observed; the run succeeds only if every processing job
//! completed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveTime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{JobError, StoreError};
use crate::jobs::{
    DataPeriod, JobData, JobDefinition, JobInfo, JobResult, JobStatus, JobType, OrchestratorContext,
    OrchestratorJobStatus, ProcessingDefinition,
};
use crate::poll::{Poll, PollError, PollPolicy, poll_until};
use crate::progress::ProgressUpdater;
use crate::repositories::{JobRepository, MetadataRepository};
use crate::storage::{LakeStorage, commit_job_output};

pub const ORCHESTRATOR_STATUS_PARTITION: &str = "orchestrator_status";

/// Largest sub-range width accepted, in hours.
pub const MAX_RANGE_HOURS: u32 = 24;

/// Splits `[start, end)` into consecutive ranges of at most `max_range_hours`
/// that never cross a UTC midnight.
pub fn split_data_period(period: &DataPeriod, max_range_hours: u32) -> Result<Vec<DataPeriod>, JobError> {
    if !(1..=MAX_RANGE_HOURS).contains(&max_range_hours) {
        return Err(JobError::configuration(format!(
            "max range hours must be within 1..={MAX_RANGE_HOURS}, got {max_range_hours}"
        )));
    }

    let width = ChronoDuration::hours(i64::from(max_range_hours));
    let mut ranges = Vec::new();
    let mut cursor = period.start;

    while cursor < period.end {
        let next_midnight = (cursor.date_naive() + ChronoDuration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc();
        let end = (cursor + width).min(next_midnight).min(period.end);
        ranges.push(DataPeriod { start: cursor, end });
        cursor = end;
    }

    Ok(ranges)
}

/// Processing definitions for a run: resource type varies slowest, then
/// chronological order.
pub fn processing_definitions(
    period: &DataPeriod,
    resource_types: &[String],
    max_range_hours: u32,
) -> Result<Vec<JobDefinition>, JobError> {
    if resource_types.is_empty() {
        return Err(JobError::configuration("no resource types to process"));
    }
    let ranges = split_data_period(period, max_range_hours)?;

    Ok(resource_types
        .iter()
        .flat_map(|resource_type| {
            ranges.iter().map(move |range| {
                JobDefinition::Processing(ProcessingDefinition {
                    resource_type: resource_type.clone(),
                    data_period: *range,
                })
            })
        })
        .collect())
}

/// Aggregates the terminal processing jobs of one run. Only completed jobs
/// contribute record counts.
pub fn aggregate_status(group_id: i64, jobs: &[JobInfo]) -> OrchestratorJobStatus {
    let mut status = OrchestratorJobStatus::new(group_id);

    for job in jobs {
        match job.status {
            JobStatus::Completed => {
                status.completed_jobs += 1;
                if let Some(JobResult::Processing(result)) = &job.result {
                    *status
                        .processed_counts
                        .entry(result.resource_type.clone())
                        .or_default() += result.processed_count;
                    *status
                        .skipped_counts
                        .entry(result.resource_type.clone())
                        .or_default() += result.skipped_count;
                }
            }
            JobStatus::Failed => {
                status.failed_jobs += 1;
                status.total_errors += 1;
            }
            JobStatus::Cancelled => status.cancelled_jobs += 1,
            JobStatus::Created | JobStatus::Running => {}
        }
    }

    status
}

pub struct OrchestratorJob {
    jobs: JobRepository,
    metadata: MetadataRepository,
    storage: Arc<dyn LakeStorage>,
    poll: PollPolicy,
}

impl OrchestratorJob {
    pub fn new(
        jobs: JobRepository,
        metadata: MetadataRepository,
        storage: Arc<dyn LakeStorage>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            jobs,
            metadata,
            storage,
            poll,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, group_id = job.group_id))]
    pub async fn execute(
        &self,
        job: &JobInfo,
        progress: &ProgressUpdater,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JobError> {
        let JobDefinition::Orchestrator(definition) = &job.definition else {
            return Err(JobError::configuration(format!(
                "job {} is not an orchestrator job",
                job.id
            )));
        };

        let definitions = processing_definitions(
            &definition.data_period,
            &definition.resource_types,
            definition.max_range_hours,
        )?;

        // Re-enqueueing after a restart returns the jobs created the first time.
        let enqueued = self
            .jobs
            .enqueue(&job.queue_type, job.group_id, &definitions, false)
            .await?;
        let tracked: BTreeSet<Uuid> = enqueued.iter().map(|j| j.id).collect();
        info!(
            period = %definition.data_period,
            processing_jobs = tracked.len(),
            "Processing jobs enqueued"
        );

        let context = Mutex::new(match &job.data {
            Some(JobData::Orchestrator(stored)) => stored.clone(),
            _ => OrchestratorContext::default(),
        });

        let outcome = poll_until(&self.poll, cancel, || {
            self.observe(job, &tracked, &context, progress)
        })
        .await;

        let finished = match outcome {
            Ok(finished) => finished,
            Err(PollError::Cancelled) => return Err(self.on_cancel(job).await),
            Err(PollError::TimedOut(waited)) => {
                return Err(JobError::retriable(format!(
                    "processing jobs still running after {waited:?}"
                )));
            }
            Err(PollError::Failed(e)) => return Err(e),
        };

        let status = aggregate_status(job.group_id, &finished);
        self.metadata
            .put(ORCHESTRATOR_STATUS_PARTITION, &job.group_id.to_string(), &status)
            .await?;

        let total = finished.len();
        let failed = status.failed_jobs + status.cancelled_jobs;
        if failed > 0 {
            warn!(failed, total, "Orchestrator run has failed processing jobs");
            return Err(JobError::SubJobsFailed { failed, total });
        }

        info!(
            completed = status.completed_jobs,
            processed = status.total_processed(),
            "Orchestrator run completed"
        );
        Ok(JobResult::Orchestrator(status))
    }

    /// One poll probe: commits newly completed jobs and reports whether the
    /// whole run is terminal.
    async fn observe(
        &self,
        job: &JobInfo,
        tracked: &BTreeSet<Uuid>,
        context: &Mutex<OrchestratorContext>,
        progress: &ProgressUpdater,
    ) -> Result<Poll<Vec<JobInfo>>, JobError> {
        let jobs: Vec<JobInfo> = self
            .jobs
            .get_jobs_by_group(&job.queue_type, job.group_id)
            .await?
            .into_iter()
            .filter(|j| tracked.contains(&j.id))
            .collect();

        if jobs.len() != tracked.len() {
            return Err(StoreError::NotFound {
                kind: "processing job",
                key: format!("group {}", job.group_id),
            }
            .into());
        }

        let mut context = context.lock().await;
        let mut committed_any = false;
        for finished in jobs.iter().filter(|j| j.status == JobStatus::Completed) {
            if context.committed_job_ids.contains(&finished.id) {
                continue;
            }
            commit_job_output(self.storage.as_ref(), finished.id).await?;
            context.committed_job_ids.insert(finished.id);
            committed_any = true;
        }

        if committed_any {
            progress.report(JobData::Orchestrator(context.clone())).await?;
            progress.flush().await?;
        }

        if jobs.iter().all(|j| j.status.is_terminal()) {
            Ok(Poll::Ready(jobs))
        } else {
            Ok(Poll::Pending)
        }
    }

    /// Propagates an operator cancellation to the processing jobs. A plain
    /// shutdown leaves them running for the next orchestrator owner.
    async fn on_cancel(&self, job: &JobInfo) -> JobError {
        match self.jobs.get_job(job.id).await {
            Ok(current) if current.cancel_requested => {
                match self
                    .jobs
                    .cancel_jobs_by_group(&job.queue_type, job.group_id, Some(JobType::Processing))
                    .await
                {
                    Ok(touched) => info!(touched, "Cancellation propagated to processing jobs"),
                    Err(e) => return e.into(),
                }
                JobError::Cancelled
            }
            Ok(_) => JobError::Cancelled,
            Err(e) => e.into(),
        }
    }
}
