//! # Data Sources
//!
//! A data source pages through the records of one resource type inside a time
//! range. The continuation token is opaque to callers; `None` (or an empty
//! token) in a page means the range is exhausted.

pub mod fhir;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::jobs::DataPeriod;
use crate::retry::Retryable;

pub use fhir::FhirApiDataSource;

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub records: Vec<JsonValue>,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("source throttled the request (retry after {retry_after_secs:?}s)")]
    Throttled { retry_after_secs: Option<u64> },
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("source request failed permanently: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn throttled(retry_after_secs: Option<u64>) -> Self {
        Self::Throttled { retry_after_secs }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal(message.into())
    }

    /// Maps a non-success HTTP status to an error kind.
    pub fn from_status(status: u16, body: Option<String>, retry_after_secs: Option<u64>) -> Self {
        let message = format!("HTTP {}: {}", status, body.as_deref().unwrap_or("No body"));
        match status {
            429 => Self::throttled(retry_after_secs),
            408 | 500..=599 => Self::transient(message),
            _ => Self::fatal(message),
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, SourceError::Fatal(_))
    }
}

impl Retryable for SourceError {
    fn is_retriable(&self) -> bool {
        SourceError::is_retriable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::Throttled {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetches the page after `continuation_token`, or the first page.
    async fn fetch(
        &self,
        resource_type: &str,
        period: &DataPeriod,
        continuation_token: Option<&str>,
    ) -> Result<SourcePage, SourceError>;
}
