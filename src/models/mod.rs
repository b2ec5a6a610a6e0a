//! # Data Models
//!
//! SeaORM entities backing the persisted job store.

pub mod job;
pub mod metadata_entry;

pub use job::Entity as Job;
pub use metadata_entry::Entity as MetadataEntry;
