//! # Job Payloads
//!
//! Typed payloads carried by persisted jobs. The `definition`, `data` and
//! `result` columns are JSON on disk; in memory each is a tagged enum keyed by
//! the job type, converted explicitly at the repository boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{JobError, StoreError};
use crate::models::job;

/// Queue shared by the orchestrator and its processing jobs.
pub const DEFAULT_QUEUE: &str = "fhir_to_datalake";

/// Orchestrator jobs are dequeued ahead of processing jobs.
pub const ORCHESTRATOR_PRIORITY: i16 = 10;
pub const PROCESSING_PRIORITY: i16 = 0;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Created,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Orchestrator,
    Processing,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Orchestrator => "orchestrator",
            JobType::Processing => "processing",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DataPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, JobError> {
        if end <= start {
            return Err(JobError::configuration(format!(
                "data period end {end} must be after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

impl fmt::Display for DataPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorDefinition {
    pub data_period: DataPeriod,
    pub resource_types: Vec<String>,
    pub max_range_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingDefinition {
    pub resource_type: String,
    pub data_period: DataPeriod,
}

/// Immutable description of the work a job performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobDefinition {
    Orchestrator(OrchestratorDefinition),
    Processing(ProcessingDefinition),
}

impl JobDefinition {
    pub fn job_type(&self) -> JobType {
        match self {
            JobDefinition::Orchestrator(_) => JobType::Orchestrator,
            JobDefinition::Processing(_) => JobType::Processing,
        }
    }

    pub fn priority(&self) -> i16 {
        match self {
            JobDefinition::Orchestrator(_) => ORCHESTRATOR_PRIORITY,
            JobDefinition::Processing(_) => PROCESSING_PRIORITY,
        }
    }

    /// Lowercase hex SHA-256 of the canonical JSON encoding.
    ///
    /// Field order is fixed by the struct declarations, so equal definitions
    /// always hash equally.
    pub fn content_hash(&self) -> Result<String, StoreError> {
        let canonical = serde_json::to_vec(self).map_err(|source| StoreError::Serialization {
            kind: "job definition",
            source,
        })?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

/// Resumable cursor of one processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub resource_type: String,
    pub data_period: DataPeriod,
    pub continuation_token: Option<String>,
    pub search_count: u64,
    pub processed_count: u64,
    pub skipped_count: u64,
    /// Id of the last partition written, `None` before the first. Parts
    /// `0..=part_id` are on storage and are never written again.
    #[serde(default)]
    pub part_id: Option<u32>,
    pub is_completed: bool,
}

impl TaskContext {
    pub fn new(definition: &ProcessingDefinition) -> Self {
        Self {
            resource_type: definition.resource_type.clone(),
            data_period: definition.data_period,
            continuation_token: None,
            search_count: 0,
            processed_count: 0,
            skipped_count: 0,
            part_id: None,
            is_completed: false,
        }
    }

    /// Id the next partition is written under.
    pub fn next_part_id(&self) -> u32 {
        self.part_id.map_or(0, |last| last + 1)
    }

    pub fn parts_written(&self) -> u32 {
        self.next_part_id()
    }

    /// Applies the outcome of one fetched page.
    ///
    /// `is_completed` flips exactly when the source reported no next token.
    pub fn advance(&mut self, next_token: Option<String>, searched: u64, processed: u64, skipped: u64) {
        self.continuation_token = next_token.filter(|token| !token.is_empty());
        self.search_count += searched;
        self.processed_count += processed;
        self.skipped_count += skipped;
        self.is_completed = self.continuation_token.is_none();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorContext {
    /// Processing jobs whose staged output has been moved to the result area.
    pub committed_job_ids: BTreeSet<Uuid>,
}

/// Mutable scratch state stored in the job's `data` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobData {
    Orchestrator(OrchestratorContext),
    Processing(TaskContext),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub resource_type: String,
    pub data_period: DataPeriod,
    pub search_count: u64,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub parts_written: u32,
}

impl From<&TaskContext> for ProcessingResult {
    fn from(context: &TaskContext) -> Self {
        Self {
            resource_type: context.resource_type.clone(),
            data_period: context.data_period,
            search_count: context.search_count,
            processed_count: context.processed_count,
            skipped_count: context.skipped_count,
            parts_written: context.parts_written(),
        }
    }
}

/// Aggregate of one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorJobStatus {
    pub group_id: i64,
    /// Processed record counts of completed jobs, keyed by resource type.
    pub processed_counts: BTreeMap<String, u64>,
    pub skipped_counts: BTreeMap<String, u64>,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub total_errors: usize,
}

impl OrchestratorJobStatus {
    pub fn new(group_id: i64) -> Self {
        Self {
            group_id,
            ..Default::default()
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.processed_counts.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    Orchestrator(OrchestratorJobStatus),
    Processing(ProcessingResult),
}

/// Decoded view of a job row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: Uuid,
    pub queue_type: String,
    pub group_id: i64,
    pub status: JobStatus,
    pub priority: i16,
    pub attempts: i32,
    pub definition: JobDefinition,
    pub definition_hash: String,
    pub data: Option<JobData>,
    pub result: Option<JobResult>,
    pub error: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub version: i64,
    pub worker_id: Option<String>,
    pub create_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn job_type(&self) -> JobType {
        self.definition.job_type()
    }

    /// The persisted task context, if this is a processing job that has
    /// flushed progress.
    pub fn task_context(&self) -> Option<&TaskContext> {
        match &self.data {
            Some(JobData::Processing(context)) => Some(context),
            _ => None,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    id: Uuid,
    field: &str,
    value: serde_json::Value,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        kind: "job",
        key: id.to_string(),
        details: format!("{field}: {e}"),
    })
}

impl TryFrom<job::Model> for JobInfo {
    type Error = StoreError;

    fn try_from(model: job::Model) -> Result<Self, Self::Error> {
        let id = model.id;
        let status = model.status.parse().map_err(|details| StoreError::Corrupt {
            kind: "job",
            key: id.to_string(),
            details,
        })?;

        Ok(Self {
            id,
            queue_type: model.queue_type,
            group_id: model.group_id,
            status,
            priority: model.priority,
            attempts: model.attempts,
            definition: decode(id, "definition", model.definition)?,
            definition_hash: model.definition_hash,
            data: model.data.map(|v| decode(id, "data", v)).transpose()?,
            result: model.result.map(|v| decode(id, "result", v)).transpose()?,
            error: model.error,
            cancel_requested: model.cancel_requested,
            version: model.version,
            worker_id: model.worker_id,
            create_date: model.create_date.with_timezone(&Utc),
            start_date: model.start_date.map(|d| d.with_timezone(&Utc)),
            end_date: model.end_date.map(|d| d.with_timezone(&Utc)),
            heartbeat_at: model.heartbeat_at.map(|d| d.with_timezone(&Utc)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn period() -> DataPeriod {
        DataPeriod::new(
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_data_period_rejects_empty_range() {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let err = DataPeriod::new(start, start).unwrap_err();
        assert!(matches!(err, JobError::Configuration { .. }));
    }

    #[test]
    fn test_content_hash_is_stable_and_distinct() {
        let patient = JobDefinition::Processing(ProcessingDefinition {
            resource_type: "Patient".to_string(),
            data_period: period(),
        });
        let observation = JobDefinition::Processing(ProcessingDefinition {
            resource_type: "Observation".to_string(),
            data_period: period(),
        });

        let first = patient.content_hash().unwrap();
        assert_eq!(first, patient.clone().content_hash().unwrap());
        assert_eq!(first.len(), 64);
        assert_ne!(first, observation.content_hash().unwrap());
    }

    #[test]
    fn test_definition_is_tagged_by_job_type() {
        let definition = JobDefinition::Processing(ProcessingDefinition {
            resource_type: "Patient".to_string(),
            data_period: period(),
        });
        let json = serde_json::to_value(&definition).unwrap();
        assert_eq!(json["type"], "processing");
        assert_eq!(json["resource_type"], "Patient");
    }

    #[test]
    fn test_task_context_completes_only_on_empty_token() {
        let mut context = TaskContext::new(&ProcessingDefinition {
            resource_type: "Patient".to_string(),
            data_period: period(),
        });

        context.advance(Some("page-2".to_string()), 10, 9, 1);
        assert!(!context.is_completed);
        assert_eq!(context.continuation_token.as_deref(), Some("page-2"));

        context.advance(Some(String::new()), 5, 5, 0);
        assert!(context.is_completed);
        assert_eq!(context.continuation_token, None);
        assert_eq!(context.search_count, 15);
        assert_eq!(context.processed_count, 14);
        assert_eq!(context.skipped_count, 1);
    }

    #[test]
    fn test_part_id_tracks_last_written_partition() {
        let mut context = TaskContext::new(&ProcessingDefinition {
            resource_type: "Patient".to_string(),
            data_period: period(),
        });
        assert_eq!(context.part_id, None);
        assert_eq!(context.next_part_id(), 0);
        assert_eq!(context.parts_written(), 0);

        context.part_id = Some(5);
        assert_eq!(context.next_part_id(), 6);
        assert_eq!(context.parts_written(), 6);

        // Contexts stored before the first partition carry no part id.
        let legacy: TaskContext = serde_json::from_value(serde_json::json!({
            "resource_type": "Patient",
            "data_period": { "start": "2021-01-01T00:00:00Z", "end": "2021-01-02T00:00:00Z" },
            "continuation_token": null,
            "search_count": 0,
            "processed_count": 0,
            "skipped_count": 0,
            "is_completed": false
        }))
        .unwrap();
        assert_eq!(legacy.next_part_id(), 0);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
