//! # Lake Storage
//!
//! Blob storage for converted partitions plus the path layout of the lake.
//! Processing jobs write under `staging/{jobId}/...`; once the orchestrator
//! sees a job completed it moves that job's files to the same relative path
//! under `result/`. Writing the same path with the same bytes is idempotent.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::retry::Retryable;

pub use local::LocalLakeStorage;
pub use memory::MemoryLakeStorage;

pub const STAGING_ROOT: &str = "staging";
pub const RESULT_ROOT: &str = "result";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("storage I/O failed for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Retryable for StorageError {
    fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Io { .. })
    }
}

#[async_trait]
pub trait LakeStorage: Send + Sync {
    /// Writes `bytes` at `path`, replacing any previous content, and returns
    /// a URL for the blob.
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError>;

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Paths under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Moves a blob. A missing source is a no-op so interrupted moves can be
    /// replayed.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError>;
}

pub fn staging_prefix(job_id: Uuid) -> String {
    format!("{STAGING_ROOT}/{job_id}")
}

/// Deterministic name of one output partition.
pub fn staging_partition_path(
    job_id: Uuid,
    resource_type: &str,
    day: NaiveDate,
    part_id: u32,
    extension: &str,
) -> String {
    format!(
        "{}/{}/{:04}/{:02}/{:02}/{}_{}_{:05}.{}",
        staging_prefix(job_id),
        resource_type,
        day.year(),
        day.month(),
        day.day(),
        resource_type,
        job_id,
        part_id,
        extension
    )
}

/// The committed location of a staged blob.
pub fn result_path(job_id: Uuid, staged_path: &str) -> Option<String> {
    let prefix = format!("{}/", staging_prefix(job_id));
    staged_path
        .strip_prefix(&prefix)
        .map(|relative| format!("{RESULT_ROOT}/{relative}"))
}

/// Moves every staged blob of `job_id` into the result area and drops the
/// staging prefix. Returns the number of blobs moved; replaying a finished
/// commit moves nothing.
pub async fn commit_job_output(storage: &dyn LakeStorage, job_id: Uuid) -> Result<usize, StorageError> {
    let staged = storage.list(&staging_prefix(job_id)).await?;
    let mut moved = 0;

    for path in &staged {
        let Some(target) = result_path(job_id, path) else {
            continue;
        };
        storage.rename(path, &target).await?;
        moved += 1;
    }

    storage.delete_prefix(&staging_prefix(job_id)).await?;
    info!(job_id = %job_id, moved, "Committed staged output");
    Ok(moved)
}

/// Rejects paths that could escape the storage root.
pub(crate) fn validate_path(path: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| StorageError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(invalid("paths must be relative and use '/'"));
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(invalid("empty or relative segment"));
    }
    Ok(())
}
