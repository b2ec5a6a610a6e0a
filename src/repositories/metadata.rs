//! # Metadata Repository
//!
//! Partition/row keyed JSON entities with optimistic concurrency, the table
//! storage counterpart of the job queue. Holds the scheduler's current
//! trigger, orchestrator summaries and leases.

use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, is_unique_violation};
use crate::models::metadata_entry::{ActiveModel, Column, Entity};
use crate::repositories::versioned::{Versioned, compare_and_swap, retry_on_conflict};

#[derive(Clone)]
pub struct MetadataRepository {
    db: DatabaseConnection,
    conflict_retries: u32,
}

impl MetadataRepository {
    pub fn new(db: DatabaseConnection, conflict_retries: u32) -> Self {
        Self {
            db,
            conflict_retries,
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let Some(entry) = Entity::find_by_id((partition_key.to_string(), row_key.to_string()))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        let value = serde_json::from_value(entry.payload).map_err(|e| StoreError::Corrupt {
            kind: "metadata entry",
            key: format!("{partition_key}/{row_key}"),
            details: e.to_string(),
        })?;

        Ok(Some(Versioned {
            value,
            version: entry.version,
        }))
    }

    /// Inserts a new entity; an existing row is reported as a version conflict.
    pub async fn insert<T: Serialize>(
        &self,
        partition_key: &str,
        row_key: &str,
        value: &T,
    ) -> Result<i64, StoreError> {
        let entry = ActiveModel {
            partition_key: Set(partition_key.to_string()),
            row_key: Set(row_key.to_string()),
            version: Set(0),
            payload: Set(to_payload(value)?),
            updated_at: Set(Utc::now().fixed_offset()),
        };

        match entry.insert(&self.db).await {
            Ok(model) => Ok(model.version),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::conflict(format!("{partition_key}/{row_key}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the entity if it is still at `expected_version`.
    pub async fn compare_and_swap<T: Serialize>(
        &self,
        partition_key: &str,
        row_key: &str,
        value: &T,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        compare_and_swap(
            &self.db,
            Entity::update_many()
                .col_expr(Column::Payload, sea_orm::sea_query::Expr::value(to_payload(value)?))
                .col_expr(
                    Column::UpdatedAt,
                    sea_orm::sea_query::Expr::value(Utc::now().fixed_offset()),
                )
                .filter(Column::PartitionKey.eq(partition_key))
                .filter(Column::RowKey.eq(row_key)),
            Column::Version,
            expected_version,
            &format!("{partition_key}/{row_key}"),
        )
        .await
    }

    /// Read-modify-write of one entity; `mutate` receives the current value
    /// (or `None`) and returns the value to store.
    pub async fn update<T, F>(
        &self,
        partition_key: &str,
        row_key: &str,
        mutate: F,
    ) -> Result<Versioned<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(Option<T>) -> Result<T, StoreError> + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict("metadata entry", self.conflict_retries, move || async move {
            let current = self.get::<T>(partition_key, row_key).await?;
            match current {
                Some(Versioned { value, version }) => {
                    let next = mutate(Some(value))?;
                    let version = self
                        .compare_and_swap(partition_key, row_key, &next, version)
                        .await?;
                    Ok(Versioned {
                        value: next,
                        version,
                    })
                }
                None => {
                    let next = mutate(None)?;
                    let version = self.insert(partition_key, row_key, &next).await?;
                    Ok(Versioned {
                        value: next,
                        version,
                    })
                }
            }
        })
        .await
    }

    /// Unconditionally stores `value`, creating the row if needed.
    pub async fn put<T>(&self, partition_key: &str, row_key: &str, value: &T) -> Result<i64, StoreError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        self.update(partition_key, row_key, |_: Option<T>| Ok(value.clone()))
            .await
            .map(|stored| stored.version)
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialization {
        kind: "metadata entry",
        source,
    })
}
