//! Migration to create the jobs table.
//!
//! Holds orchestrator and processing jobs for every queue. Each row carries an
//! optimistic-concurrency `version` that is compared-and-swapped on every write.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::QueueType).text().not_null())
                    .col(ColumnDef::new(Jobs::GroupId).big_integer().not_null())
                    .col(ColumnDef::new(Jobs::JobType).text().not_null())
                    .col(ColumnDef::new(Jobs::DefinitionHash).text().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("created"),
                    )
                    .col(
                        ColumnDef::new(Jobs::Priority)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::Definition).json_binary().not_null())
                    .col(ColumnDef::new(Jobs::Data).json_binary().null())
                    .col(ColumnDef::new(Jobs::Result).json_binary().null())
                    .col(ColumnDef::new(Jobs::Error).json_binary().null())
                    .col(
                        ColumnDef::new(Jobs::CancelRequested)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Jobs::Version)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Jobs::WorkerId).text().null())
                    .col(
                        ColumnDef::new(Jobs::CreateDate)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::StartDate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Jobs::EndDate).timestamp_with_time_zone().null())
                    .col(
                        ColumnDef::new(Jobs::HeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Picking the next job: status first, then priority DESC and age.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_jobs_queue_status_priority ON jobs (queue_type, status, priority DESC, create_date)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_queue_group")
                    .table(Jobs::Table)
                    .col(Jobs::QueueType)
                    .col(Jobs::GroupId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_jobs_queue_status_priority")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_jobs_queue_group").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    QueueType,
    GroupId,
    JobType,
    DefinitionHash,
    Status,
    Priority,
    Attempts,
    Definition,
    Data,
    Result,
    Error,
    CancelRequested,
    Version,
    WorkerId,
    CreateDate,
    StartDate,
    EndDate,
    HeartbeatAt,
    UpdatedAt,
}
