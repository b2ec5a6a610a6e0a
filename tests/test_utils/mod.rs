//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite job store setup plus an in-process FHIR source fake.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fhir_lake_sync::jobs::DataPeriod;
use fhir_lake_sync::repositories::{JobRepository, MetadataRepository};
use fhir_lake_sync::source::{DataSource, SourceError, SourcePage};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Mutex;

pub const TEST_QUEUE: &str = "fhir_to_datalake_test";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Job and metadata repositories over a fresh in-memory store.
pub async fn setup_repositories() -> Result<(JobRepository, MetadataRepository)> {
    let db = setup_test_db().await?;
    Ok((
        JobRepository::new(db.clone(), 20),
        MetadataRepository::new(db, 20),
    ))
}

pub fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

pub fn period(start: DateTime<Utc>, end: DateTime<Utc>) -> DataPeriod {
    DataPeriod::new(start, end).unwrap()
}

/// A FHIR resource with `meta.lastUpdated` set.
pub fn resource(resource_type: &str, id: &str, last_updated: DateTime<Utc>) -> JsonValue {
    json!({
        "resourceType": resource_type,
        "id": id,
        "meta": { "lastUpdated": last_updated.to_rfc3339() },
    })
}

/// Pages through a fixed record set the way a FHIR search would.
///
/// Records are filtered by resource type and period and served
/// `page_size` at a time; the continuation token is the offset of the next
/// page. A failure registered for a token is returned once, the first time
/// that token is fetched.
pub struct PagedSource {
    records: Vec<JsonValue>,
    page_size: usize,
    delay: Option<Duration>,
    failures: Mutex<Vec<(Option<String>, SourceError)>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl PagedSource {
    pub fn new(records: Vec<JsonValue>, page_size: usize) -> Self {
        Self {
            records,
            page_size: page_size.max(1),
            delay: None,
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(records: Vec<JsonValue>, page_size: usize) -> Arc<Self> {
        Arc::new(Self::new(records, page_size))
    }

    /// Sleeps before serving every page.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn fail_at(&self, token: Option<&str>, error: SourceError) {
        self.failures
            .lock()
            .await
            .push((token.map(str::to_string), error));
    }

    /// `(resource_type, continuation_token)` of every fetch, in order.
    pub async fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().await.clone()
    }

    fn matching(&self, resource_type: &str, period: &DataPeriod) -> Vec<JsonValue> {
        self.records
            .iter()
            .filter(|r| r["resourceType"] == resource_type)
            .filter(|r| {
                r.pointer("/meta/lastUpdated")
                    .and_then(JsonValue::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .is_some_and(|ts| period.contains(ts.with_timezone(&Utc)))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DataSource for PagedSource {
    async fn fetch(
        &self,
        resource_type: &str,
        period: &DataPeriod,
        continuation_token: Option<&str>,
    ) -> Result<SourcePage, SourceError> {
        self.calls
            .lock()
            .await
            .push((resource_type.to_string(), continuation_token.map(str::to_string)));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().await;
            let token = continuation_token.map(str::to_string);
            if let Some(index) = failures.iter().position(|(at, _)| *at == token) {
                return Err(failures.remove(index).1);
            }
        }

        let offset: usize = match continuation_token {
            Some(token) => token
                .parse()
                .map_err(|_| SourceError::fatal(format!("bad token {token}")))?,
            None => 0,
        };

        let matching = self.matching(resource_type, period);
        let end = (offset + self.page_size).min(matching.len());
        let records = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();

        Ok(SourcePage {
            records,
            next_continuation_token: (end < matching.len()).then(|| end.to_string()),
        })
    }
}
