//! # Progress Updater
//!
//! Decouples a running job from the latency of persisting its progress. The
//! job reports its latest state as often as it likes; a background task keeps
//! only the newest report and writes it on a fixed cadence, on an explicit
//! flush, and once more when the updater is closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{JobError, StoreError};
use crate::jobs::JobData;
use crate::repositories::JobRepository;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("progress updater stopped unexpectedly")]
    Stopped,
}

impl From<ProgressError> for JobError {
    fn from(error: ProgressError) -> Self {
        match error {
            ProgressError::Store(e) => e.into(),
            ProgressError::Stopped => JobError::internal(error.to_string()),
        }
    }
}

/// Destination of flushed progress.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn persist(&self, data: &JobData) -> Result<(), StoreError>;
}

/// Writes progress into the job record owned by `worker_id`.
pub struct JobProgressSink {
    jobs: JobRepository,
    job_id: Uuid,
    worker_id: String,
}

impl JobProgressSink {
    pub fn new(jobs: JobRepository, job_id: Uuid, worker_id: impl Into<String>) -> Self {
        Self {
            jobs,
            job_id,
            worker_id: worker_id.into(),
        }
    }
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn persist(&self, data: &JobData) -> Result<(), StoreError> {
        self.jobs
            .put_job_data(self.job_id, &self.worker_id, data)
            .await
            .map(|_| ())
    }
}

enum Command {
    Report(JobData),
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

pub struct ProgressUpdater {
    sender: mpsc::Sender<Command>,
    handle: JoinHandle<Result<(), StoreError>>,
}

impl ProgressUpdater {
    pub fn spawn(sink: Arc<dyn ProgressSink>, flush_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(sink, receiver, flush_interval));
        Self { sender, handle }
    }

    /// Replaces the buffered state; earlier unflushed reports are dropped.
    pub async fn report(&self, data: JobData) -> Result<(), ProgressError> {
        self.sender
            .send(Command::Report(data))
            .await
            .map_err(|_| ProgressError::Stopped)
    }

    /// Writes the buffered state now and waits for the write.
    pub async fn flush(&self) -> Result<(), ProgressError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Flush(reply))
            .await
            .map_err(|_| ProgressError::Stopped)?;
        response.await.map_err(|_| ProgressError::Stopped)?.map_err(Into::into)
    }

    /// Flushes whatever is buffered and stops the background task.
    pub async fn close(self) -> Result<(), ProgressError> {
        drop(self.sender);
        match self.handle.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ProgressError::Stopped),
        }
    }
}

async fn run(
    sink: Arc<dyn ProgressSink>,
    mut receiver: mpsc::Receiver<Command>,
    flush_interval: Duration,
) -> Result<(), StoreError> {
    let mut pending: Option<JobData> = None;
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            command = receiver.recv() => match command {
                Some(Command::Report(data)) => pending = Some(data),
                Some(Command::Flush(reply)) => {
                    let result = flush_pending(sink.as_ref(), &mut pending).await;
                    let _ = reply.send(result);
                }
                None => return flush_pending(sink.as_ref(), &mut pending).await,
            },
            _ = ticker.tick() => {
                if let Err(e) = flush_pending(sink.as_ref(), &mut pending).await {
                    warn!(error = %e, "Periodic progress flush failed");
                }
            }
        }
    }
}

async fn flush_pending(sink: &dyn ProgressSink, pending: &mut Option<JobData>) -> Result<(), StoreError> {
    let Some(data) = pending.take() else {
        return Ok(());
    };

    if let Err(e) = sink.persist(&data).await {
        // Keep it for the next attempt unless something newer arrives first.
        *pending = Some(data);
        return Err(e);
    }
    debug!("Progress flushed");
    Ok(())
}
