//! Trigger scheduler state machine and lease exclusion.

mod test_utils;

use std::time::Duration;

use chrono::{DateTime, Utc};
use fhir_lake_sync::error::JobError;
use fhir_lake_sync::jobs::{JobResult, JobStatus, JobType, OrchestratorJobStatus};
use fhir_lake_sync::repositories::{JobRepository, LeaseRepository, MetadataRepository};
use fhir_lake_sync::scheduler::{
    SchedulerSettings, TRIGGER_LEASE_RESOURCE, TickOutcome, TriggerScheduler, TriggerStatus,
};
use test_utils::{TEST_QUEUE, period, setup_repositories, utc};

fn settings(instance_id: &str) -> SchedulerSettings {
    SchedulerSettings {
        queue_type: TEST_QUEUE.to_string(),
        instance_id: instance_id.to_string(),
        resource_types: vec!["Patient".to_string()],
        max_range_hours: 24,
        tick_interval: Duration::from_secs(60),
        safety_lag: Duration::from_secs(300),
        start_time: utc(2021, 1, 1, 0),
        end_time: Some(utc(2021, 1, 3, 0)),
        lease_duration: Duration::from_secs(60),
    }
}

fn now() -> DateTime<Utc> {
    utc(2021, 6, 1, 0)
}

async fn scheduler() -> (TriggerScheduler, JobRepository, MetadataRepository) {
    let (jobs, metadata) = setup_repositories().await.unwrap();
    let scheduler = TriggerScheduler::new(jobs.clone(), metadata.clone(), settings("scheduler-a"));
    (scheduler, jobs, metadata)
}

async fn claim_orchestrator(jobs: &JobRepository) -> fhir_lake_sync::jobs::JobInfo {
    jobs.dequeue(
        TEST_QUEUE,
        "worker",
        Duration::from_secs(60),
        Some(JobType::Orchestrator),
    )
    .await
    .unwrap()
    .expect("orchestrator job enqueued")
}

#[tokio::test]
async fn test_failed_run_leaves_watermark_and_retries_window() {
    let (scheduler, jobs, _) = scheduler().await;

    let started = scheduler.tick(now()).await.unwrap();
    assert_eq!(
        started,
        TickOutcome::Started {
            sequence_id: 1,
            window: period(utc(2021, 1, 1, 0), utc(2021, 1, 3, 0)),
        }
    );

    let orchestrator = claim_orchestrator(&jobs).await;
    assert_eq!(orchestrator.group_id, 1);
    jobs.fail_job(
        orchestrator.id,
        "worker",
        &JobError::SubJobsFailed { failed: 1, total: 2 },
        3,
    )
    .await
    .unwrap();

    let failed = scheduler.tick(now()).await.unwrap();
    assert!(matches!(failed, TickOutcome::Failed { sequence_id: 1, ref error } if error.contains("1 of 2")));

    let state = scheduler.current_state().await.unwrap().unwrap();
    assert_eq!(state.last_scheduled_timestamp, utc(2021, 1, 1, 0));
    assert_eq!(
        state.current_trigger.unwrap().trigger_status,
        TriggerStatus::Failed
    );

    let retried = scheduler.tick(now()).await.unwrap();
    assert_eq!(
        retried,
        TickOutcome::Started {
            sequence_id: 2,
            window: period(utc(2021, 1, 1, 0), utc(2021, 1, 3, 0)),
        }
    );
    let retry_jobs = jobs.get_jobs_by_group(TEST_QUEUE, 2).await.unwrap();
    assert_eq!(retry_jobs.len(), 1);
    assert_ne!(retry_jobs[0].id, orchestrator.id);
}

#[tokio::test]
async fn test_completed_run_advances_watermark_once() {
    let (scheduler, jobs, _) = scheduler().await;
    scheduler.tick(now()).await.unwrap();

    let waiting = scheduler.tick(now()).await.unwrap();
    assert_eq!(
        waiting,
        TickOutcome::Waiting {
            sequence_id: 1,
            status: JobStatus::Created
        }
    );

    let orchestrator = claim_orchestrator(&jobs).await;
    jobs.complete_job(
        orchestrator.id,
        "worker",
        &JobResult::Orchestrator(OrchestratorJobStatus::new(1)),
    )
    .await
    .unwrap();

    let completed = scheduler.tick(now()).await.unwrap();
    assert_eq!(
        completed,
        TickOutcome::Completed {
            sequence_id: 1,
            watermark: utc(2021, 1, 3, 0),
        }
    );

    // The configured end time is reached, so nothing further is scheduled.
    assert_eq!(scheduler.tick(now()).await.unwrap(), TickOutcome::NoWindow);

    let state = scheduler.current_state().await.unwrap().unwrap();
    assert_eq!(state.last_scheduled_timestamp, utc(2021, 1, 3, 0));
    let trigger = state.current_trigger.unwrap();
    assert_eq!(trigger.trigger_status, TriggerStatus::Completed);
    assert_eq!(trigger.orchestrator_job_id, Some(orchestrator.id));
}

#[tokio::test]
async fn test_window_respects_safety_lag() {
    let (scheduler, _, _) = scheduler().await;

    // Four minutes after the start time the lagged window is still empty.
    let early = utc(2021, 1, 1, 0) + chrono::Duration::minutes(4);
    assert_eq!(scheduler.tick(early).await.unwrap(), TickOutcome::NoWindow);
    assert!(scheduler.current_state().await.unwrap().is_none());

    let later = utc(2021, 1, 1, 12);
    assert_eq!(
        scheduler.tick(later).await.unwrap(),
        TickOutcome::Started {
            sequence_id: 1,
            window: period(utc(2021, 1, 1, 0), later - chrono::Duration::minutes(5)),
        }
    );
}

#[tokio::test]
async fn test_lease_holder_excludes_other_instances() {
    let (scheduler, jobs, metadata) = scheduler().await;
    let leases = LeaseRepository::new(metadata.clone());

    let lease = leases
        .try_acquire(TRIGGER_LEASE_RESOURCE, "scheduler-b", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(scheduler.tick(now()).await.unwrap(), TickOutcome::LeaseUnavailable);
    assert!(scheduler.current_state().await.unwrap().is_none());

    leases.release(&lease).await.unwrap();
    assert!(matches!(
        scheduler.tick(now()).await.unwrap(),
        TickOutcome::Started { sequence_id: 1, .. }
    ));
    assert_eq!(jobs.get_jobs_by_group(TEST_QUEUE, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_schedulers_start_one_trigger() {
    let (jobs, metadata) = setup_repositories().await.unwrap();
    let a = TriggerScheduler::new(jobs.clone(), metadata.clone(), settings("scheduler-a"));
    let b = TriggerScheduler::new(jobs.clone(), metadata.clone(), settings("scheduler-b"));

    for _ in 0..3 {
        let (ra, rb) = tokio::join!(a.tick(now()), b.tick(now()));
        for outcome in [ra.unwrap(), rb.unwrap()] {
            assert!(matches!(
                outcome,
                TickOutcome::Started { sequence_id: 1, .. }
                    | TickOutcome::Waiting { sequence_id: 1, .. }
                    | TickOutcome::LeaseUnavailable
            ));
        }
    }

    assert_eq!(jobs.get_jobs_by_group(TEST_QUEUE, 1).await.unwrap().len(), 1);
    assert!(jobs.get_jobs_by_group(TEST_QUEUE, 2).await.unwrap().is_empty());
}
