//! Adds a partial unique index preventing two live jobs with the same definition
//! in one group. Failed and cancelled jobs fall out of the index so the same
//! definition can be enqueued again.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_definition \
                 ON jobs (queue_type, group_id, definition_hash) \
                 WHERE status IN ('created','running','completed')"
                    .to_string(),
            ))
            .await
            .map(|_| ())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_jobs_active_definition",
            ))
            .await
            .map(|_| ())
    }
}
