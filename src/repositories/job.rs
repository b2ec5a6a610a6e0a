//! # Job Repository
//!
//! The persisted job queue. Jobs are grouped by a `group_id` (one orchestrator
//! run) inside a named queue. Every mutation is a read-modify-write of the full
//! row guarded by the row's `version`; on conflict the whole operation is
//! re-run from a fresh read.

use std::time::Duration;

use chrono::Utc;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, StoreError, is_unique_violation};
use crate::jobs::{JobData, JobDefinition, JobInfo, JobResult, JobStatus, JobType};
use crate::models::job::{self, ActiveModel, Column, Entity, Model};
use crate::repositories::versioned::{compare_and_swap, retry_on_conflict};

/// Statuses that make a definition "taken" within its group.
const ACTIVE_STATUSES: [JobStatus; 3] = [JobStatus::Created, JobStatus::Running, JobStatus::Completed];

/// Job store and queue operations over the `jobs` table.
#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
    conflict_retries: u32,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection, conflict_retries: u32) -> Self {
        Self {
            db,
            conflict_retries,
        }
    }

    /// Creates one job per definition unless an equivalent one already exists.
    ///
    /// A definition is equivalent when its content hash matches a job of the
    /// same group that is created, running or completed. With
    /// `force_one_active_per_identity` a created or running job with the same
    /// hash in any group of the queue is reused as well.
    pub async fn enqueue(
        &self,
        queue_type: &str,
        group_id: i64,
        definitions: &[JobDefinition],
        force_one_active_per_identity: bool,
    ) -> Result<Vec<JobInfo>, StoreError> {
        let mut jobs = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let hash = definition.content_hash()?;

            if let Some(existing) = self
                .find_equivalent(queue_type, group_id, &hash, force_one_active_per_identity)
                .await?
            {
                debug!(job_id = %existing.id, group_id, "Reusing existing job for definition");
                jobs.push(JobInfo::try_from(existing)?);
                continue;
            }

            let model = match self.insert(queue_type, group_id, definition, &hash).await {
                Ok(model) => model,
                Err(StoreError::Db(err)) if is_unique_violation(&err) => {
                    // Lost the race against a concurrent enqueue of the same definition.
                    self.find_equivalent(queue_type, group_id, &hash, false)
                        .await?
                        .ok_or(StoreError::Db(err))?
                }
                Err(err) => return Err(err),
            };

            info!(
                job_id = %model.id,
                group_id,
                job_type = %definition.job_type(),
                "Job enqueued"
            );
            jobs.push(JobInfo::try_from(model)?);
        }

        Ok(jobs)
    }

    async fn find_equivalent(
        &self,
        queue_type: &str,
        group_id: i64,
        hash: &str,
        any_group: bool,
    ) -> Result<Option<Model>, StoreError> {
        let in_group = Entity::find()
            .filter(Column::QueueType.eq(queue_type))
            .filter(Column::GroupId.eq(group_id))
            .filter(Column::DefinitionHash.eq(hash))
            .filter(Column::Status.is_in(ACTIVE_STATUSES.iter().map(|s| s.as_str())))
            .order_by_asc(Column::CreateDate)
            .one(&self.db)
            .await?;

        if in_group.is_some() || !any_group {
            return Ok(in_group);
        }

        Ok(Entity::find()
            .filter(Column::QueueType.eq(queue_type))
            .filter(Column::DefinitionHash.eq(hash))
            .filter(Column::Status.is_in([JobStatus::Created.as_str(), JobStatus::Running.as_str()]))
            .order_by_asc(Column::CreateDate)
            .one(&self.db)
            .await?)
    }

    async fn insert(
        &self,
        queue_type: &str,
        group_id: i64,
        definition: &JobDefinition,
        hash: &str,
    ) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();
        let payload = serde_json::to_value(definition).map_err(|source| StoreError::Serialization {
            kind: "job definition",
            source,
        })?;

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            queue_type: Set(queue_type.to_string()),
            group_id: Set(group_id),
            job_type: Set(definition.job_type().as_str().to_string()),
            definition_hash: Set(hash.to_string()),
            status: Set(JobStatus::Created.as_str().to_string()),
            priority: Set(definition.priority()),
            attempts: Set(0),
            definition: Set(payload),
            data: Set(None),
            result: Set(None),
            error: Set(None),
            cancel_requested: Set(false),
            version: Set(0),
            worker_id: Set(None),
            create_date: Set(now),
            start_date: Set(None),
            end_date: Set(None),
            heartbeat_at: Set(None),
            updated_at: Set(now),
        };

        Ok(job.insert(&self.db).await?)
    }

    /// Claims one job for `worker_id`.
    ///
    /// Created jobs go first (highest priority, then oldest). Otherwise a
    /// running job whose heartbeat is older than `heartbeat_timeout` is
    /// reclaimed. Candidates that were asked to cancel are closed as
    /// cancelled instead of being handed out.
    pub async fn dequeue(
        &self,
        queue_type: &str,
        worker_id: &str,
        heartbeat_timeout: Duration,
        job_type: Option<JobType>,
    ) -> Result<Option<JobInfo>, StoreError> {
        let mut conflicts = 0u32;

        loop {
            let Some(candidate) = self
                .next_candidate(queue_type, heartbeat_timeout, job_type)
                .await?
            else {
                return Ok(None);
            };

            let now = Utc::now().fixed_offset();
            let expected = candidate.version;
            let mut next = candidate.clone();
            next.updated_at = now;

            let abandoned_cancel = candidate.cancel_requested;
            if abandoned_cancel {
                next.status = JobStatus::Cancelled.as_str().to_string();
                next.end_date = Some(now);
                next.worker_id = None;
            } else {
                next.status = JobStatus::Running.as_str().to_string();
                next.worker_id = Some(worker_id.to_string());
                next.heartbeat_at = Some(now);
                next.start_date = candidate.start_date.or(Some(now));
                next.attempts = candidate.attempts + 1;
            }

            match self.write(expected, next).await {
                Ok(model) if abandoned_cancel => {
                    info!(job_id = %model.id, "Closed queued job that was asked to cancel");
                }
                Ok(model) => {
                    if candidate.status == JobStatus::Running.as_str() {
                        warn!(
                            job_id = %model.id,
                            previous_worker = ?candidate.worker_id,
                            "Reclaimed job with expired heartbeat"
                        );
                    }
                    metrics::counter!("jobs_dequeued_total").increment(1);
                    return JobInfo::try_from(model).map(Some);
                }
                Err(err) if err.is_conflict() => {
                    conflicts += 1;
                    if conflicts >= self.conflict_retries.max(1) {
                        return Err(StoreError::ConflictRetriesExhausted {
                            entity: "job".to_string(),
                            attempts: conflicts,
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn next_candidate(
        &self,
        queue_type: &str,
        heartbeat_timeout: Duration,
        job_type: Option<JobType>,
    ) -> Result<Option<Model>, StoreError> {
        let mut created = Entity::find()
            .filter(Column::QueueType.eq(queue_type))
            .filter(Column::Status.eq(JobStatus::Created.as_str()));
        if let Some(job_type) = job_type {
            created = created.filter(Column::JobType.eq(job_type.as_str()));
        }
        let created = created
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::CreateDate)
            .one(&self.db)
            .await?;
        if created.is_some() {
            return Ok(created);
        }

        let timeout = chrono::Duration::from_std(heartbeat_timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
            .fixed_offset();

        let mut expired = Entity::find()
            .filter(Column::QueueType.eq(queue_type))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(
                Condition::any()
                    .add(Column::HeartbeatAt.is_null())
                    .add(Column::HeartbeatAt.lt(cutoff)),
            );
        if let Some(job_type) = job_type {
            expired = expired.filter(Column::JobType.eq(job_type.as_str()));
        }

        Ok(expired
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::HeartbeatAt)
            .one(&self.db)
            .await?)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobInfo, StoreError> {
        JobInfo::try_from(self.find_model(id).await?)
    }

    pub async fn get_jobs_by_group(
        &self,
        queue_type: &str,
        group_id: i64,
    ) -> Result<Vec<JobInfo>, StoreError> {
        Entity::find()
            .filter(Column::QueueType.eq(queue_type))
            .filter(Column::GroupId.eq(group_id))
            .order_by_asc(Column::CreateDate)
            .all(&self.db)
            .await?
            .into_iter()
            .map(JobInfo::try_from)
            .collect()
    }

    /// Refreshes the heartbeat of a job owned by `worker_id`.
    ///
    /// Returns `false` when the caller should stop working on the job: a
    /// cancellation was requested or the job is no longer owned by the caller.
    pub async fn keep_alive(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let outcome = self
            .update_job(id, |job| {
                ensure_owner(job, worker_id)?;
                job.heartbeat_at = Some(Utc::now().fixed_offset());
                Ok(!job.cancel_requested)
            })
            .await;

        match outcome {
            Ok((_, keep_going)) => Ok(keep_going),
            Err(StoreError::NotOwner { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Persists the job's mutable progress state.
    pub async fn put_job_data(
        &self,
        id: Uuid,
        worker_id: &str,
        data: &JobData,
    ) -> Result<JobInfo, StoreError> {
        let payload = to_json("job data", data)?;
        self.update_job(id, |job| {
            ensure_owner(job, worker_id)?;
            job.data = Some(payload.clone());
            job.heartbeat_at = Some(Utc::now().fixed_offset());
            Ok(())
        })
        .await
        .map(|(job, _)| job)
    }

    pub async fn complete_job(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &JobResult,
    ) -> Result<JobInfo, StoreError> {
        let payload = to_json("job result", result)?;
        let (job, _) = self
            .update_job(id, |job| {
                ensure_owner(job, worker_id)?;
                let now = Utc::now().fixed_offset();
                job.status = JobStatus::Completed.as_str().to_string();
                job.result = Some(payload.clone());
                job.error = None;
                job.end_date = Some(now);
                job.heartbeat_at = Some(now);
                Ok(())
            })
            .await?;

        info!(job_id = %job.id, group_id = job.group_id, "Job completed");
        Ok(job)
    }

    /// Records a failure.
    ///
    /// Retriable errors put the job back to `created` while it has attempts
    /// left; its `data` is kept so the next owner resumes from the last flushed
    /// progress. Anything else marks the job failed. A job that was asked to
    /// cancel is closed as cancelled rather than re-queued.
    pub async fn fail_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &JobError,
        max_attempts: u32,
    ) -> Result<JobInfo, StoreError> {
        let (job, requeued) = self
            .update_job(id, |job| {
                ensure_owner(job, worker_id)?;
                let now = Utc::now().fixed_offset();
                let requeue = error.is_retriable()
                    && u32::try_from(job.attempts).unwrap_or(u32::MAX) < max_attempts;

                job.error = Some(error.to_details(job.attempts));
                job.worker_id = None;
                if job.cancel_requested {
                    job.status = JobStatus::Cancelled.as_str().to_string();
                    job.end_date = Some(now);
                    return Ok(false);
                }
                if requeue {
                    job.status = JobStatus::Created.as_str().to_string();
                    job.heartbeat_at = None;
                } else {
                    job.status = JobStatus::Failed.as_str().to_string();
                    job.end_date = Some(now);
                }
                Ok(requeue)
            })
            .await?;

        if requeued {
            warn!(job_id = %job.id, attempts = job.attempts, error = %error, "Job failed, re-queued");
        } else if job.status == JobStatus::Cancelled {
            info!(job_id = %job.id, error = %error, "Job failed after cancellation was requested; closed as cancelled");
        } else {
            warn!(job_id = %job.id, attempts = job.attempts, error = %error, "Job failed");
        }
        Ok(job)
    }

    /// Closes a job whose owner observed a cancellation request.
    pub async fn cancel_job(&self, id: Uuid, worker_id: &str) -> Result<JobInfo, StoreError> {
        let (job, _) = self
            .update_job(id, |job| {
                ensure_owner(job, worker_id)?;
                job.status = JobStatus::Cancelled.as_str().to_string();
                job.end_date = Some(Utc::now().fixed_offset());
                job.worker_id = None;
                Ok(())
            })
            .await?;

        info!(job_id = %job.id, "Job cancelled");
        Ok(job)
    }

    /// Hands an owned job back to the queue without recording a failure.
    ///
    /// A job with a pending cancellation request is closed as cancelled
    /// instead.
    pub async fn release_job(&self, id: Uuid, worker_id: &str) -> Result<JobInfo, StoreError> {
        self.update_job(id, |job| {
            ensure_owner(job, worker_id)?;
            job.worker_id = None;
            job.heartbeat_at = None;
            if job.cancel_requested {
                job.status = JobStatus::Cancelled.as_str().to_string();
                job.end_date = Some(Utc::now().fixed_offset());
            } else {
                job.status = JobStatus::Created.as_str().to_string();
            }
            Ok(())
        })
        .await
        .map(|(job, _)| job)
    }

    /// Requests cancellation of every non-terminal job in a group.
    ///
    /// Created jobs are cancelled directly; running jobs get
    /// `cancel_requested` so their owner stops at its next boundary. Returns
    /// the number of jobs touched.
    pub async fn cancel_jobs_by_group(
        &self,
        queue_type: &str,
        group_id: i64,
        job_type: Option<JobType>,
    ) -> Result<usize, StoreError> {
        let mut touched = 0;

        for job in self.get_jobs_by_group(queue_type, group_id).await? {
            if job.status.is_terminal() || (job.status == JobStatus::Running && job.cancel_requested) {
                continue;
            }
            if job_type.is_some_and(|t| t != job.job_type()) {
                continue;
            }

            let outcome = self
                .update_job(job.id, |job| {
                    let status: JobStatus = job.status.parse().map_err(|details| StoreError::Corrupt {
                        kind: "job",
                        key: job.id.to_string(),
                        details,
                    })?;
                    match status {
                        JobStatus::Created => {
                            job.status = JobStatus::Cancelled.as_str().to_string();
                            job.cancel_requested = true;
                            job.end_date = Some(Utc::now().fixed_offset());
                        }
                        JobStatus::Running => job.cancel_requested = true,
                        _ => return Ok(false),
                    }
                    Ok(true)
                })
                .await?;

            if outcome.1 {
                touched += 1;
            }
        }

        info!(group_id, touched, "Cancellation requested for group");
        Ok(touched)
    }

    async fn find_model(&self, id: Uuid) -> Result<Model, StoreError> {
        Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "job",
                key: id.to_string(),
            })
    }

    /// Read-modify-write of one job under optimistic concurrency.
    async fn update_job<T, F>(&self, id: Uuid, mutate: F) -> Result<(JobInfo, T), StoreError>
    where
        F: Fn(&mut Model) -> Result<T, StoreError> + Sync,
        T: Send,
    {
        let mutate = &mutate;
        retry_on_conflict("job", self.conflict_retries, move || async move {
            let current = self.find_model(id).await?;
            let mut next = current.clone();
            let output = mutate(&mut next)?;
            next.updated_at = Utc::now().fixed_offset();
            let written = self.write(current.version, next).await?;
            Ok((JobInfo::try_from(written)?, output))
        })
        .await
    }

    async fn write(&self, expected: i64, next: Model) -> Result<Model, StoreError> {
        let mut active: ActiveModel = next.clone().into();
        active = active.reset_all();
        active.id = NotSet;
        active.version = NotSet;

        let version = compare_and_swap(
            &self.db,
            Entity::update_many()
                .set(active)
                .filter(Column::Id.eq(next.id)),
            Column::Version,
            expected,
            "job",
        )
        .await?;

        Ok(job::Model { version, ..next })
    }
}

fn ensure_owner(job: &Model, worker_id: &str) -> Result<(), StoreError> {
    if job.status == JobStatus::Running.as_str() && job.worker_id.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(StoreError::NotOwner {
            job_id: job.id,
            worker_id: worker_id.to_string(),
        })
    }
}

fn to_json<T: serde::Serialize>(kind: &'static str, value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialization { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DataPeriod, ProcessingDefinition, TaskContext};
    use chrono::TimeZone;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    const QUEUE: &str = "test_queue";

    async fn setup() -> JobRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        JobRepository::new(db, 5)
    }

    fn definition(resource_type: &str, day: u32) -> JobDefinition {
        JobDefinition::Processing(ProcessingDefinition {
            resource_type: resource_type.to_string(),
            data_period: DataPeriod::new(
                Utc.with_ymd_and_hms(2021, 1, day, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2021, 1, day + 1, 0, 0, 0).unwrap(),
            )
            .unwrap(),
        })
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_within_group() {
        let repo = setup().await;
        let defs = vec![definition("Patient", 1), definition("Patient", 2)];

        let first = repo.enqueue(QUEUE, 7, &defs, false).await.unwrap();
        let second = repo.enqueue(QUEUE, 7, &defs, false).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[1].id, second[1].id);
        assert_eq!(repo.get_jobs_by_group(QUEUE, 7).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_block_reenqueue() {
        let repo = setup().await;
        let defs = vec![definition("Patient", 1)];
        let first = repo.enqueue(QUEUE, 1, &defs, false).await.unwrap();

        let job = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        repo.fail_job(job.id, "w1", &JobError::configuration("bad"), 3)
            .await
            .unwrap();

        let second = repo.enqueue(QUEUE, 1, &defs, false).await.unwrap();
        assert_ne!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn test_force_one_active_reuses_job_from_other_group() {
        let repo = setup().await;
        let defs = vec![definition("Patient", 1)];

        let first = repo.enqueue(QUEUE, 1, &defs, true).await.unwrap();
        let other_group = repo.enqueue(QUEUE, 2, &defs, true).await.unwrap();
        let unforced = repo.enqueue(QUEUE, 3, &defs, false).await.unwrap();

        assert_eq!(first[0].id, other_group[0].id);
        assert_ne!(first[0].id, unforced[0].id);
    }

    #[tokio::test]
    async fn test_dequeue_claims_each_job_once() {
        let repo = setup().await;
        repo.enqueue(QUEUE, 1, &[definition("Patient", 1)], false)
            .await
            .unwrap();

        let claimed = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

        let none = repo
            .dequeue(QUEUE, "w2", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_expired_heartbeat_is_reclaimed() {
        let repo = setup().await;
        repo.enqueue(QUEUE, 1, &[definition("Patient", 1)], false)
            .await
            .unwrap();
        let first = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reclaimed = repo
            .dequeue(QUEUE, "w2", Duration::from_millis(1), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.attempts, 2);
        assert!(!repo.keep_alive(first.id, "w1").await.unwrap());
        assert!(repo.keep_alive(first.id, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn test_keep_alive_reports_cancellation() {
        let repo = setup().await;
        repo.enqueue(QUEUE, 4, &[definition("Patient", 1), definition("Patient", 2)], false)
            .await
            .unwrap();
        let running = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();

        let touched = repo.cancel_jobs_by_group(QUEUE, 4, None).await.unwrap();
        assert_eq!(touched, 2);

        assert!(!repo.keep_alive(running.id, "w1").await.unwrap());
        let jobs = repo.get_jobs_by_group(QUEUE, 4).await.unwrap();
        let created = jobs.iter().find(|j| j.id != running.id).unwrap();
        assert_eq!(created.status, JobStatus::Cancelled);

        let closed = repo.cancel_job(running.id, "w1").await.unwrap();
        assert_eq!(closed.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retriable_failure_requeues_until_attempts_exhausted() {
        let repo = setup().await;
        repo.enqueue(QUEUE, 1, &[definition("Patient", 1)], false)
            .await
            .unwrap();

        let job = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        let requeued = repo
            .fail_job(job.id, "w1", &JobError::retriable("timeout"), 2)
            .await
            .unwrap();
        assert_eq!(requeued.status, JobStatus::Created);
        assert_eq!(requeued.error.as_ref().unwrap()["kind"], "retriable");

        let job = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();
        let failed = repo
            .fail_job(job.id, "w1", &JobError::retriable("timeout"), 2)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.end_date.is_some());
    }

    #[tokio::test]
    async fn test_put_job_data_requires_ownership() {
        let repo = setup().await;
        let defs = vec![definition("Patient", 1)];
        repo.enqueue(QUEUE, 1, &defs, false).await.unwrap();
        let job = repo
            .dequeue(QUEUE, "w1", Duration::from_secs(60), None)
            .await
            .unwrap()
            .unwrap();

        let JobDefinition::Processing(ref processing) = job.definition else {
            panic!("expected a processing job");
        };
        let mut context = TaskContext::new(processing);
        context.part_id = Some(3);

        let stored = repo
            .put_job_data(job.id, "w1", &JobData::Processing(context.clone()))
            .await
            .unwrap();
        assert_eq!(stored.task_context(), Some(&context));
        assert_eq!(stored.version, job.version + 1);

        let err = repo
            .put_job_data(job.id, "intruder", &JobData::Processing(context))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let repo = setup().await;
        let job = repo
            .enqueue(QUEUE, 1, &[definition("Patient", 1)], false)
            .await
            .unwrap()
            .remove(0);
        let model = repo.find_model(job.id).await.unwrap();

        let mut first = model.clone();
        first.priority = 5;
        repo.write(model.version, first).await.unwrap();

        let mut second = model.clone();
        second.priority = 9;
        let err = repo.write(model.version, second).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = repo.get_job(job.id).await.unwrap();
        assert_eq!(stored.priority, 5);
        assert_eq!(stored.version, 1);
    }
}
