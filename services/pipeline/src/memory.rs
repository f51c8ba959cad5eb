//! In-process broker.
//!
//! Follows the same lease and retention rules as the Postgres broker. Time is
//! read from `tokio::time::Instant`, so tests can drive expiry with a paused
//! clock.

use crate::broker::{Broker, BrokerError, FailDisposition, Lease};
use crate::config::QueueConfig;
use crate::job::{FailureKind, FetchOutcome, JobDescriptor, JobError, JobFailure, JobId, JobStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
enum Outcome {
    Success(serde_json::Value),
    Failure(JobFailure),
}

#[derive(Debug)]
struct ActiveLease {
    token: Uuid,
    deadline: Instant,
}

#[derive(Debug)]
struct Entry {
    descriptor: JobDescriptor,
    status: JobStatus,
    attempts: u32,
    visible_at: Instant,
    lease: Option<ActiveLease>,
    outcome: Option<Outcome>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn finish(&mut self, outcome: Outcome, now: Instant, ttl: Duration) {
        self.status = match outcome {
            Outcome::Success(_) => JobStatus::Success,
            Outcome::Failure(_) => JobStatus::Failure,
        };
        self.outcome = Some(outcome);
        self.lease = None;
        self.expires_at = Some(now + ttl);
    }
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<JobId>,
    entries: HashMap<JobId, Entry>,
}

impl Inner {
    /// Redeliver expired leases and drop results past their retention window
    fn maintain(&mut self, now: Instant, max_attempts: u32, ttl: Duration) {
        for (id, entry) in self.entries.iter_mut() {
            let expired = matches!(&entry.lease, Some(lease) if lease.deadline <= now);
            if entry.status != JobStatus::Running || !expired {
                continue;
            }

            if entry.attempts >= max_attempts {
                warn!(job_id = %id, attempts = entry.attempts, "Lease expired on final attempt");
                entry.finish(
                    Outcome::Failure(JobFailure {
                        kind: FailureKind::LeaseExhausted,
                        message: "visibility timeout exceeded on final attempt".to_string(),
                    }),
                    now,
                    ttl,
                );
                metrics::counter!("queue.jobs.failed", "kind" => FailureKind::LeaseExhausted.as_str())
                    .increment(1);
            } else {
                debug!(job_id = %id, attempts = entry.attempts, "Lease expired, redelivering");
                entry.status = JobStatus::Retry;
                entry.lease = None;
                entry.visible_at = now;
                self.ready.push_back(id.clone());
                metrics::counter!("queue.jobs.redelivered").increment(1);
            }
        }

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !matches!(entry.expires_at, Some(at) if at <= now));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired results");
            let entries = &self.entries;
            self.ready.retain(|id| entries.contains_key(id));
        }
    }
}

/// Broker state held in process memory
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
    result_ttl: Duration,
    retry_delay: Duration,
    max_attempts: u32,
}

impl MemoryBroker {
    pub fn new(config: &QueueConfig) -> Self {
        info!(
            visibility_timeout_secs = config.visibility_timeout_secs,
            result_ttl_secs = config.result_ttl_secs,
            max_attempts = config.max_attempts(),
            "Creating in-memory broker"
        );
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout: config.visibility_timeout(),
            result_ttl: config.result_ttl(),
            retry_delay: config.retry_delay(),
            max_attempts: config.max_attempts(),
        }
    }

    /// Number of jobs currently tracked, including retained results
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        guard.maintain(now, self.max_attempts, self.result_ttl);

        if guard.entries.contains_key(&job.id) {
            return Err(BrokerError::DuplicateJob(job.id.clone()));
        }

        guard.entries.insert(
            job.id.clone(),
            Entry {
                descriptor: job.clone(),
                status: JobStatus::Pending,
                attempts: 0,
                visible_at: now,
                lease: None,
                outcome: None,
                expires_at: None,
            },
        );
        guard.ready.push_back(job.id.clone());
        metrics::counter!("queue.jobs.enqueued").increment(1);
        debug!(job_id = %job.id, kind = %job.kind, "Enqueued job");
        Ok(())
    }

    async fn reserve(&self, worker_id: &str) -> Result<Option<Lease>, BrokerError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.maintain(now, self.max_attempts, self.result_ttl);

        let entries = &inner.entries;
        let position = inner.ready.iter().position(|id| {
            entries.get(id).map_or(false, |entry| {
                matches!(entry.status, JobStatus::Pending | JobStatus::Retry)
                    && entry.visible_at <= now
            })
        });

        let Some(position) = position else {
            return Ok(None);
        };
        let Some(id) = inner.ready.remove(position) else {
            return Ok(None);
        };
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        entry.status = JobStatus::Running;
        entry.attempts += 1;
        entry.lease = Some(ActiveLease {
            token,
            deadline: now + self.visibility_timeout,
        });

        Ok(Some(Lease {
            descriptor: entry.descriptor.clone(),
            token,
            attempt: entry.attempts,
            worker_id: worker_id.to_string(),
        }))
    }

    async fn complete(
        &self,
        lease: &Lease,
        result: serde_json::Value,
    ) -> Result<bool, BrokerError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(entry) = inner.entries.get_mut(lease.job_id()) else {
            warn!(job_id = %lease.job_id(), "Completion for unknown or expired job discarded");
            return Ok(false);
        };
        if entry.status.is_terminal() {
            debug!(job_id = %lease.job_id(), "Job already terminal, duplicate completion discarded");
            return Ok(false);
        }

        entry.finish(Outcome::Success(result), now, self.result_ttl);
        // A redelivery may have been queued after this lease expired
        inner.ready.retain(|id| id != lease.job_id());
        Ok(true)
    }

    async fn fail(&self, lease: &Lease, error: &JobError) -> Result<FailDisposition, BrokerError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(entry) = inner.entries.get_mut(lease.job_id()) else {
            return Ok(FailDisposition::Discarded);
        };
        let holds_lease = matches!(&entry.lease, Some(active) if active.token == lease.token);
        if entry.status.is_terminal() || !holds_lease {
            debug!(job_id = %lease.job_id(), "Stale failure report discarded");
            return Ok(FailDisposition::Discarded);
        }

        if error.retryable && entry.attempts < self.max_attempts {
            entry.status = JobStatus::Retry;
            entry.lease = None;
            entry.visible_at = now + self.retry_delay;
            inner.ready.push_back(lease.job_id().clone());
            return Ok(FailDisposition::Retrying {
                attempt: entry.attempts,
            });
        }

        entry.finish(Outcome::Failure(error.to_failure()), now, self.result_ttl);
        Ok(FailDisposition::Terminal)
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus, BrokerError> {
        let mut guard = self.inner.lock();
        guard.maintain(Instant::now(), self.max_attempts, self.result_ttl);
        Ok(guard
            .entries
            .get(job_id)
            .map_or(JobStatus::Unknown, |entry| entry.status))
    }

    async fn fetch(&self, job_id: &JobId) -> Result<FetchOutcome, BrokerError> {
        let mut guard = self.inner.lock();
        guard.maintain(Instant::now(), self.max_attempts, self.result_ttl);

        let outcome = match guard.entries.get(job_id) {
            None => FetchOutcome::Unknown,
            Some(entry) => match &entry.outcome {
                Some(Outcome::Success(value)) => FetchOutcome::Ready(value.clone()),
                Some(Outcome::Failure(failure)) => FetchOutcome::Failed(failure.clone()),
                None => FetchOutcome::NotReady(entry.status),
            },
        };
        Ok(outcome)
    }
}
