//! MetadataEntry entity model
//!
//! Partition/row keyed records with an optimistic-concurrency version. The
//! scheduler trigger, orchestrator summaries and leases all live here.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "metadata_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub partition_key: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub row_key: String,

    pub version: i64,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
