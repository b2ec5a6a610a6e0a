//! # Retry with Backoff
//!
//! Call-site retries for transient data source and storage failures:
//! exponential backoff (`base * 2^n`, capped at `max`) plus random jitter, with
//! a server-provided retry-after taking precedence when it is longer.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retriable(&self) -> bool;

    /// Minimum delay requested by the remote side, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: E,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter_factor: 0.2,
            max_attempts: 5,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            jitter_factor: config.jitter_factor,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempts_completed` failures.
    pub fn backoff_delay<R: Rng + ?Sized>(
        &self,
        attempts_completed: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let exponent = attempts_completed.saturating_sub(1).min(30) as i32;
        let mut backoff = (self.base.as_secs_f64() * 2_f64.powi(exponent)).min(self.max.as_secs_f64());

        if let Some(retry_after) = retry_after {
            backoff = backoff.max(retry_after.as_secs_f64());
        }

        let jitter_range = self.jitter_factor * backoff;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(0.0..jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64(backoff + jitter)
    }
}

/// Runs `operation` until it succeeds, fails permanently, runs out of
/// attempts or `cancel` fires. The token is only observed between attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + Retryable + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempts += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retriable() || attempts >= max_attempts {
            return Err(RetryError::Failed {
                attempts,
                source: error,
            });
        }

        let delay = policy.backoff_delay(attempts, error.retry_after(), &mut rand::thread_rng());
        warn!(
            operation = operation_name,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        metrics::counter!("source_fetch_retries_total").increment(1);

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
