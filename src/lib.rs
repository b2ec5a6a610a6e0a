//! # FHIR Lake Sync Library
//!
//! Incremental extraction of FHIR resources into a partitioned data lake:
//! the persisted job queue, orchestrator and processing jobs, progress
//! tracking and the trigger scheduler that drives them.

pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod orchestrator;
pub mod poll;
pub mod processing;
pub mod progress;
pub mod repositories;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod telemetry;
pub mod worker;
pub use migration;
