//! # Versioned Records
//!
//! Every mutable row in the store carries a `version` column. Writers read the
//! row, compute the next state and write it back with
//! `UPDATE ... SET version = expected + 1 WHERE key = ? AND version = expected`.
//! Zero affected rows means another writer got there first; the caller then
//! re-reads and re-runs the whole operation through [`retry_on_conflict`].

use std::future::Future;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, UpdateMany};
use tracing::debug;

use crate::error::StoreError;

/// A decoded value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// Applies `update` only if the row still has version `expected`.
///
/// Returns the new version on success and [`StoreError::VersionConflict`]
/// when the row moved on (or vanished).
pub async fn compare_and_swap<E, C>(
    conn: &C,
    update: UpdateMany<E>,
    version_column: E::Column,
    expected: i64,
    entity: &str,
) -> Result<i64, StoreError>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let next = expected + 1;
    let result = update
        .col_expr(version_column, Expr::value(next))
        .filter(version_column.eq(expected))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(StoreError::conflict(entity));
    }

    Ok(next)
}

/// Re-runs a read-modify-write `operation` while it reports version
/// conflicts, up to `max_attempts` runs in total.
pub async fn retry_on_conflict<T, F, Fut>(
    entity: &str,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Err(error) if error.is_conflict() => {
                if attempt >= max_attempts {
                    return Err(StoreError::ConflictRetriesExhausted {
                        entity: entity.to_string(),
                        attempts: attempt,
                    });
                }
                debug!(entity, attempt, "Version conflict, re-reading");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
