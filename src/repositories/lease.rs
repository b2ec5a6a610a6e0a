//! # Leases
//!
//! Time-bounded exclusive ownership of a named resource, stored as a metadata
//! entity in the `lease` partition. Acquire, renew and release are all
//! compare-and-swap writes, so two holders can never both believe they own a
//! live lease. A crashed holder's lease simply expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::repositories::metadata::MetadataRepository;

pub const LEASE_PARTITION: &str = "lease";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LeaseRecord {
    holder: Option<String>,
    expires_at: DateTime<Utc>,
}

/// A lease held by this process.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub resource: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    version: i64,
}

#[derive(Clone)]
pub struct LeaseRepository {
    metadata: MetadataRepository,
}

impl LeaseRepository {
    pub fn new(metadata: MetadataRepository) -> Self {
        Self { metadata }
    }

    /// Takes the lease if it is free, expired or already ours.
    ///
    /// Returns `None` when another holder owns a live lease or won the race.
    pub async fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let record = LeaseRecord {
            holder: Some(holder.to_string()),
            expires_at: expiry(now, duration),
        };

        let written = match self
            .metadata
            .get::<LeaseRecord>(LEASE_PARTITION, resource)
            .await?
        {
            None => self.metadata.insert(LEASE_PARTITION, resource, &record).await,
            Some(current) => {
                let live_elsewhere = current.value.expires_at > now
                    && current.value.holder.as_deref().is_some_and(|h| h != holder);
                if live_elsewhere {
                    debug!(resource, holder = ?current.value.holder, "Lease held elsewhere");
                    return Ok(None);
                }
                self.metadata
                    .compare_and_swap(LEASE_PARTITION, resource, &record, current.version)
                    .await
            }
        };

        match written {
            Ok(version) => Ok(Some(Lease {
                resource: resource.to_string(),
                holder: holder.to_string(),
                expires_at: record.expires_at,
                version,
            })),
            Err(err) if err.is_conflict() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Extends a held lease. Fails with a version conflict if it was lost.
    pub async fn renew(&self, lease: &Lease, duration: Duration) -> Result<Lease, StoreError> {
        let record = LeaseRecord {
            holder: Some(lease.holder.clone()),
            expires_at: expiry(Utc::now(), duration),
        };
        let version = self
            .metadata
            .compare_and_swap(LEASE_PARTITION, &lease.resource, &record, lease.version)
            .await?;

        Ok(Lease {
            expires_at: record.expires_at,
            version,
            ..lease.clone()
        })
    }

    /// Gives the lease up. Releasing a lease that was already lost is a no-op.
    pub async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let record = LeaseRecord {
            holder: None,
            expires_at: Utc::now(),
        };
        match self
            .metadata
            .compare_and_swap(LEASE_PARTITION, &lease.resource, &record, lease.version)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                warn!(resource = %lease.resource, "Lease was lost before release");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Acquires `resource` and wraps it in a guard that releases on drop.
    pub async fn acquire_guard(
        &self,
        resource: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<Option<LeaseGuard>, StoreError> {
        Ok(self
            .try_acquire(resource, holder, duration)
            .await?
            .map(|lease| LeaseGuard {
                leases: self.clone(),
                lease: Some(lease),
            }))
    }
}

fn expiry(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Scoped ownership of a lease.
///
/// Call [`LeaseGuard::release`] on the normal path. If the guard is dropped
/// while still holding the lease (an early return, an error or a cancelled
/// future), the release is spawned onto the current runtime; lease expiry
/// covers the case where no runtime is left.
pub struct LeaseGuard {
    leases: LeaseRepository,
    lease: Option<Lease>,
}

impl LeaseGuard {
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Extends the lease; a lost lease surfaces as a version conflict.
    pub async fn renew(&mut self, duration: Duration) -> Result<(), StoreError> {
        if let Some(lease) = &self.lease {
            let renewed = self.leases.renew(lease, duration).await?;
            self.lease = Some(renewed);
        }
        Ok(())
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        match self.lease.take() {
            Some(lease) => self.leases.release(&lease).await,
            None => Ok(()),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let leases = self.leases.clone();
        handle.spawn(async move {
            if let Err(e) = leases.release(&lease).await {
                warn!(resource = %lease.resource, error = %e, "Failed to release dropped lease");
            }
        });
    }
}
