//! Broker contract shared by the in-memory and Postgres implementations.

use crate::job::{FetchOutcome, JobDescriptor, JobError, JobId, JobStatus};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {0} already enqueued")]
    DuplicateJob(JobId),

    #[error("Timed out after {0:?} waiting for job result")]
    Timeout(Duration),

    #[error("Corrupt broker record: {0}")]
    Corrupt(String),
}

/// A broker-provided ownership lease on one delivery of a job
#[derive(Debug, Clone)]
pub struct Lease {
    pub descriptor: JobDescriptor,
    /// Identifies this delivery; a redelivery gets a new token
    pub token: Uuid,
    /// 1-based delivery count
    pub attempt: u32,
    pub worker_id: String,
}

impl Lease {
    pub fn job_id(&self) -> &JobId {
        &self.descriptor.id
    }
}

/// What the broker did with a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// The job will be redelivered
    Retrying { attempt: u32 },
    /// The job is now in terminal `Failure`
    Terminal,
    /// The report was ignored: the lease is stale or the job already finished
    Discarded,
}

/// Durable intermediary between submitters and competing workers.
///
/// Delivery is at-least-once. A leased job whose visibility timeout elapses
/// without completion is handed to the next `reserve` caller.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a job in `Pending`
    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), BrokerError>;

    /// Take the next visible job, if any, and move it to `Running`
    async fn reserve(&self, worker_id: &str) -> Result<Option<Lease>, BrokerError>;

    /// Publish a success result. Returns `false` when the job was already
    /// terminal (a duplicate delivery finished first) and the result was dropped.
    async fn complete(&self, lease: &Lease, result: serde_json::Value)
        -> Result<bool, BrokerError>;

    /// Report a handler failure
    async fn fail(&self, lease: &Lease, error: &JobError) -> Result<FailDisposition, BrokerError>;

    /// Non-blocking state lookup
    async fn status(&self, job_id: &JobId) -> Result<JobStatus, BrokerError>;

    /// Read the result channel for a job
    async fn fetch(&self, job_id: &JobId) -> Result<FetchOutcome, BrokerError>;
}

/// Poll the result channel until the job is terminal or `timeout` elapses.
///
/// Returns [`BrokerError::Timeout`] when the deadline passes first; the job
/// keeps running in the background.
pub async fn wait_for(
    broker: &dyn Broker,
    job_id: &JobId,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<FetchOutcome, BrokerError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let outcome = broker.fetch(job_id).await?;
        if !matches!(outcome, FetchOutcome::NotReady(_)) {
            return Ok(outcome);
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            debug!(job_id = %job_id, "Eager wait elapsed before completion");
            return Err(BrokerError::Timeout(timeout));
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
