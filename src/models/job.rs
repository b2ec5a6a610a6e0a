//! Job entity model
//!
//! This module contains the SeaORM entity model for the jobs table, which holds
//! every orchestrator and processing job together with its resumable state.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Persisted job row
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Queue the job belongs to
    pub queue_type: String,

    /// Orchestrator run this job is part of
    pub group_id: i64,

    /// Discriminator of the definition payload (orchestrator, processing)
    pub job_type: String,

    /// Hex SHA-256 of the canonical definition, used for idempotent enqueue
    pub definition_hash: String,

    /// created, running, completed, failed or cancelled
    pub status: String,

    /// Higher values are dequeued first
    pub priority: i16,

    /// Number of times the job has been dequeued
    pub attempts: i32,

    #[sea_orm(column_type = "JsonBinary")]
    pub definition: JsonValue,

    /// Mutable progress state (a serialized task context for processing jobs)
    #[sea_orm(column_type = "JsonBinary")]
    pub data: Option<JsonValue>,

    #[sea_orm(column_type = "JsonBinary")]
    pub result: Option<JsonValue>,

    /// Structured error details of the last failed attempt
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    pub cancel_requested: bool,

    /// Optimistic-concurrency token, bumped on every write
    pub version: i64,

    /// Worker currently holding the job
    pub worker_id: Option<String>,

    pub create_date: DateTimeWithTimeZone,

    pub start_date: Option<DateTimeWithTimeZone>,

    pub end_date: Option<DateTimeWithTimeZone>,

    /// Last liveness proof from the owning worker
    pub heartbeat_at: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
