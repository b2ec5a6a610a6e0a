//! # Processing Job
//!
//! Drives one `(resourceType, sub-range)` to completion. Each iteration fetches
//! one page, buckets its records by the UTC day of `meta.lastUpdated`, writes
//! one partition per non-empty day in chronological order and then advances
//! the task context. Progress is reported after every page and flushed every
//! `checkpoint_record_count` records, so a restarted job resumes from the last
//! flushed continuation token and part id.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::convert::ColumnarConverter;
use crate::error::JobError;
use crate::jobs::{JobData, JobDefinition, JobInfo, JobResult, ProcessingResult, TaskContext};
use crate::progress::ProgressUpdater;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::source::DataSource;
use crate::storage::{LakeStorage, staging_partition_path};

pub struct ProcessingJob {
    source: Arc<dyn DataSource>,
    converter: Arc<dyn ColumnarConverter>,
    storage: Arc<dyn LakeStorage>,
    retry: RetryPolicy,
    checkpoint_record_count: u64,
}

impl ProcessingJob {
    pub fn new(
        source: Arc<dyn DataSource>,
        converter: Arc<dyn ColumnarConverter>,
        storage: Arc<dyn LakeStorage>,
        retry: RetryPolicy,
        checkpoint_record_count: u64,
    ) -> Self {
        Self {
            source,
            converter,
            storage,
            retry,
            checkpoint_record_count: checkpoint_record_count.max(1),
        }
    }

    /// Runs the job from its persisted context (or from scratch).
    ///
    /// Cancellation is observed before each page; the page in flight when it
    /// fires is not reported, so the stored context stays at the last
    /// completed page.
    #[instrument(skip_all, fields(job_id = %job.id, group_id = job.group_id))]
    pub async fn execute(
        &self,
        job: &JobInfo,
        progress: &ProgressUpdater,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JobError> {
        let JobDefinition::Processing(definition) = &job.definition else {
            return Err(JobError::configuration(format!(
                "job {} is not a processing job",
                job.id
            )));
        };

        let mut context = match job.task_context() {
            Some(stored)
                if stored.resource_type == definition.resource_type
                    && stored.data_period == definition.data_period =>
            {
                info!(
                    part_id = ?stored.part_id,
                    processed = stored.processed_count,
                    "Resuming from stored task context"
                );
                stored.clone()
            }
            _ => TaskContext::new(definition),
        };

        let resource_type = definition.resource_type.as_str();
        let extension = self.converter.file_extension();
        let mut since_checkpoint = 0u64;

        while !context.is_completed {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let token = context.continuation_token.clone();
            let page = retry_with_backoff(&self.retry, cancel, "source_fetch", || {
                self.source
                    .fetch(resource_type, &context.data_period, token.as_deref())
            })
            .await?;

            let searched = page.records.len() as u64;
            let (days, skipped) = bucket_by_day(resource_type, page.records);
            let mut next = context.clone();
            let mut processed = 0u64;

            for (day, records) in days {
                processed += records.len() as u64;
                let Some(bytes) = self.converter.convert(resource_type, &records)? else {
                    continue;
                };

                let part_id = next.next_part_id();
                let path = staging_partition_path(job.id, resource_type, day, part_id, extension);
                retry_with_backoff(&self.retry, cancel, "storage_write", || {
                    self.storage.write(&path, &bytes)
                })
                .await?;

                debug!(part_id, %day, records = records.len(), "Partition written");
                metrics::counter!("processing_parts_written_total").increment(1);
                next.part_id = Some(part_id);
            }

            metrics::counter!("processing_records_total", "resource_type" => resource_type.to_string())
                .increment(processed);

            next.advance(page.next_continuation_token, searched, processed, skipped);
            context = next;
            progress.report(JobData::Processing(context.clone())).await?;

            since_checkpoint += processed + skipped;
            if since_checkpoint >= self.checkpoint_record_count || context.is_completed {
                progress.flush().await?;
                since_checkpoint = 0;
            }
        }

        info!(
            resource_type,
            processed = context.processed_count,
            skipped = context.skipped_count,
            parts = context.parts_written(),
            "Processing job finished"
        );
        Ok(JobResult::Processing(ProcessingResult::from(&context)))
    }
}

/// Groups records by the UTC day of `meta.lastUpdated`, oldest day first.
///
/// Records of another resource type or without a parsable timestamp are
/// counted as skipped.
pub fn bucket_by_day(
    resource_type: &str,
    records: Vec<JsonValue>,
) -> (BTreeMap<NaiveDate, Vec<JsonValue>>, u64) {
    let mut days: BTreeMap<NaiveDate, Vec<JsonValue>> = BTreeMap::new();
    let mut skipped = 0;

    for record in records {
        if record.get("resourceType").and_then(JsonValue::as_str) != Some(resource_type) {
            skipped += 1;
            continue;
        }

        let last_updated = record
            .pointer("/meta/lastUpdated")
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());

        match last_updated {
            Some(timestamp) => days
                .entry(timestamp.with_timezone(&Utc).date_naive())
                .or_default()
                .push(record),
            None => skipped += 1,
        }
    }

    (days, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bucket_by_day_orders_and_skips() {
        let records = vec![
            json!({"resourceType": "Patient", "id": "2", "meta": {"lastUpdated": "2021-01-02T08:00:00Z"}}),
            json!({"resourceType": "Patient", "id": "1", "meta": {"lastUpdated": "2021-01-01T23:30:00-01:00"}}),
            json!({"resourceType": "Patient", "id": "3", "meta": {"lastUpdated": "2021-01-01T10:00:00Z"}}),
            json!({"resourceType": "Patient", "id": "4"}),
            json!({"resourceType": "OperationOutcome", "id": "5"}),
        ];

        let (days, skipped) = bucket_by_day("Patient", records);
        let keys: Vec<_> = days.keys().map(|d| d.to_string()).collect();

        assert_eq!(keys, vec!["2021-01-01", "2021-01-02"]);
        assert_eq!(days[&NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()].len(), 1);
        // 23:30 at -01:00 is 00:30 UTC on the 2nd.
        assert_eq!(days[&NaiveDate::from_ymd_opt(2021, 1, 2).unwrap()].len(), 2);
        assert_eq!(skipped, 2);
    }
}
