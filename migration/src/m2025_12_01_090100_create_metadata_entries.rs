//! Migration to create the metadata_entries table.
//!
//! A partition/row keyed entity table with an optimistic-concurrency version.
//! Stores the scheduler trigger, orchestrator status summaries and leases.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MetadataEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MetadataEntries::PartitionKey)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MetadataEntries::RowKey).text().not_null())
                    .col(
                        ColumnDef::new(MetadataEntries::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(MetadataEntries::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MetadataEntries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(MetadataEntries::PartitionKey)
                            .col(MetadataEntries::RowKey),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MetadataEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MetadataEntries {
    Table,
    PartitionKey,
    RowKey,
    Version,
    Payload,
    UpdatedAt,
}
