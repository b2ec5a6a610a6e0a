//! # Polling
//!
//! Scheduled-retry primitive for waiting on state held elsewhere (the
//! orchestrator waiting on its processing jobs, the scheduler waiting on the
//! orchestrator). A poll is a probe run on a fixed interval until it yields a
//! value, the deadline passes or the cancellation token fires.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until cancelled.
    pub max_wait: Option<Duration>,
}

impl PollPolicy {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PollError<E> {
    #[error("polling cancelled")]
    Cancelled,
    #[error("polling timed out after {0:?}")]
    TimedOut(Duration),
    #[error("probe failed: {0}")]
    Failed(E),
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Runs `probe` immediately and then every `policy.interval` until it is
/// ready. A probe error ends polling.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
{
    let started = Instant::now();
    let deadline = policy.max_wait.map(|max_wait| started + max_wait);

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        if let Poll::Ready(value) = probe().await.map_err(PollError::Failed)? {
            return Ok(value);
        }

        let mut wake_at = Instant::now() + policy.interval;
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(PollError::TimedOut(started.elapsed()));
            }
            wake_at = wake_at.min(deadline);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }
}
