//! # Repository Layer
//!
//! Persistence for the job queue and the metadata it coordinates through.
//! Every write is a compare-and-swap on a `version` column (see
//! [`versioned`]); nothing here relies on in-process locks.

pub mod job;
pub mod lease;
pub mod metadata;
pub mod versioned;

pub use job::JobRepository;
pub use lease::{Lease, LeaseGuard, LeaseRepository};
pub use metadata::MetadataRepository;
pub use versioned::Versioned;
