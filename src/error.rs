//! # Error Handling
//!
//! Error taxonomy for the job orchestration core. Lower layers raise their own
//! errors (`StoreError`, `SourceError`, `StorageError`, `ConvertError`); the
//! job bodies classify them into a [`JobError`] which decides whether a failed
//! job may be dispatched again.

use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::convert::ConvertError;
use crate::retry::RetryError;
use crate::source::SourceError;
use crate::storage::StorageError;

/// Errors raised by the persisted job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict while writing {entity}")]
    VersionConflict { entity: String },
    #[error("gave up writing {entity} after {attempts} version conflicts")]
    ConflictRetriesExhausted { entity: String, attempts: u32 },
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },
    #[error("job {job_id} is no longer owned by worker {worker_id}")]
    NotOwner { job_id: uuid::Uuid, worker_id: String },
    #[error("stored {kind} '{key}' is corrupt: {details}")]
    Corrupt {
        kind: &'static str,
        key: String,
        details: String,
    },
    #[error("failed to serialize {kind}: {source}")]
    Serialization {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

impl StoreError {
    pub fn conflict<S: Into<String>>(entity: S) -> Self {
        Self::VersionConflict {
            entity: entity.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    /// Whether the failure is worth retrying at the job level.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::Db(_) | StoreError::ConflictRetriesExhausted { .. }
        )
    }
}

/// Failure classification of a job body.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// Transient failure in the data source, storage or job store.
    #[error("retriable failure: {message}")]
    Retriable { message: String },
    /// Store inconsistency or lost ownership; surfaced to operators.
    #[error("internal failure: {message}")]
    Internal { message: String },
    /// Invalid schema, time range or definition; never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String },
    /// One or more processing jobs of an orchestrator run did not complete.
    #[error("{failed} of {total} processing jobs failed")]
    SubJobsFailed { failed: usize, total: usize },
    /// Cooperative exit; not a failure.
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn retriable<S: Into<String>>(message: S) -> Self {
        Self::Retriable {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobError::Retriable { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Retriable { .. } => "retriable",
            JobError::Internal { .. } => "internal",
            JobError::Configuration { .. } => "configuration",
            JobError::SubJobsFailed { .. } => "sub_jobs_failed",
            JobError::Cancelled => "cancelled",
        }
    }

    /// Structured payload persisted into the job's `error` column.
    pub fn to_details(&self, attempts: i32) -> serde_json::Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "attempts": attempts,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

impl From<StoreError> for JobError {
    fn from(error: StoreError) -> Self {
        if error.is_retriable() {
            JobError::retriable(error.to_string())
        } else {
            JobError::internal(error.to_string())
        }
    }
}

impl From<SourceError> for JobError {
    fn from(error: SourceError) -> Self {
        if error.is_retriable() {
            JobError::retriable(error.to_string())
        } else {
            JobError::configuration(error.to_string())
        }
    }
}

impl From<StorageError> for JobError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath { .. } => JobError::configuration(error.to_string()),
            StorageError::Io { .. } => JobError::retriable(error.to_string()),
        }
    }
}

impl From<ConvertError> for JobError {
    fn from(error: ConvertError) -> Self {
        JobError::configuration(error.to_string())
    }
}

impl<E> From<RetryError<E>> for JobError
where
    E: std::error::Error + Into<JobError> + 'static,
{
    fn from(error: RetryError<E>) -> Self {
        match error {
            RetryError::Cancelled => JobError::Cancelled,
            RetryError::Failed { source, .. } => source.into(),
        }
    }
}

/// Detects unique-constraint violations across the supported backends.
pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}
