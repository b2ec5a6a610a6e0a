//! Database migrations for the job store.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_090000_create_jobs;
mod m2025_12_01_090100_create_metadata_entries;
mod m2025_12_01_090200_add_job_active_definition_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_090000_create_jobs::Migration),
            Box::new(m2025_12_01_090100_create_metadata_entries::Migration),
            Box::new(m2025_12_01_090200_add_job_active_definition_guard::Migration),
        ]
    }
}
