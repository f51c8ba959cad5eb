//! Postgres-backed broker.
//!
//! Jobs live in `job_queue`. Workers claim rows with `FOR UPDATE SKIP LOCKED`,
//! so any number of worker processes can share one table without claiming the
//! same delivery twice.

use crate::broker::{Broker, BrokerError, FailDisposition, Lease};
use crate::config::QueueConfig;
use crate::job::{FailureKind, FetchOutcome, JobDescriptor, JobError, JobFailure, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Durable broker over a shared PostgreSQL pool
pub struct PgBroker {
    pool: PgPool,
    visibility_timeout_secs: f64,
    result_ttl_secs: f64,
    retry_delay_secs: f64,
    max_attempts: i32,
}

impl PgBroker {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self {
            pool,
            visibility_timeout_secs: config.visibility_timeout().as_secs_f64(),
            result_ttl_secs: config.result_ttl().as_secs_f64(),
            retry_delay_secs: config.retry_delay().as_secs_f64(),
            max_attempts: i32::try_from(config.max_attempts()).unwrap_or(i32::MAX),
        }
    }

    /// Run queue migrations
    pub async fn run_migrations(&self) -> Result<(), BrokerError> {
        info!("Running queue migrations");

        // Metadata tables are migrated by the storage crate in the same database.
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;

        info!("Queue migrations completed");
        Ok(())
    }

    /// Redeliver lapsed leases and delete results past retention
    async fn maintain(&self) -> Result<(), BrokerError> {
        let exhausted = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'failure',
                failure_kind = $1,
                failure_message = 'visibility timeout exceeded on final attempt',
                lease_token = NULL,
                lease_expires_at = NULL,
                finished_at = now(),
                expires_at = now() + make_interval(secs => $2)
            WHERE status = 'running'
              AND lease_expires_at <= now()
              AND attempts >= $3
            "#,
        )
        .bind(FailureKind::LeaseExhausted.as_str())
        .bind(self.result_ttl_secs)
        .bind(self.max_attempts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if exhausted > 0 {
            warn!(jobs = exhausted, "Leases expired on final attempt");
            metrics::counter!("queue.jobs.failed", "kind" => FailureKind::LeaseExhausted.as_str())
                .increment(exhausted);
        }

        let redelivered = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'retry',
                lease_token = NULL,
                lease_expires_at = NULL,
                visible_at = now()
            WHERE status = 'running'
              AND lease_expires_at <= now()
              AND attempts < $1
            "#,
        )
        .bind(self.max_attempts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if redelivered > 0 {
            debug!(jobs = redelivered, "Lapsed leases made visible for redelivery");
            metrics::counter!("queue.jobs.redelivered").increment(redelivered);
        }

        let evicted = sqlx::query("DELETE FROM job_queue WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        if evicted > 0 {
            debug!(jobs = evicted, "Evicted expired results");
        }

        Ok(())
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, BrokerError> {
    raw.parse().map_err(BrokerError::Corrupt)
}

#[async_trait]
impl Broker for PgBroker {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind))]
    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), BrokerError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_queue (id, kind, payload, submitted_at, status, attempts, visible_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, now())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(job.submitted_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(BrokerError::DuplicateJob(job.id.clone()));
        }

        metrics::counter!("queue.jobs.enqueued").increment(1);
        debug!("Enqueued job");
        Ok(())
    }

    async fn reserve(&self, worker_id: &str) -> Result<Option<Lease>, BrokerError> {
        self.maintain().await?;

        let token = Uuid::new_v4();
        let row = sqlx::query_as::<_, (String, String, serde_json::Value, DateTime<Utc>, i32)>(
            r#"
            UPDATE job_queue
            SET status = 'running',
                attempts = attempts + 1,
                lease_token = $1,
                lease_expires_at = now() + make_interval(secs => $2),
                worker_id = $3
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status IN ('pending', 'retry')
                  AND visible_at <= now()
                ORDER BY visible_at, submitted_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, kind, payload, submitted_at, attempts
            "#,
        )
        .bind(token)
        .bind(self.visibility_timeout_secs)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, kind, payload, submitted_at, attempts)) = row else {
            return Ok(None);
        };

        Ok(Some(Lease {
            descriptor: JobDescriptor {
                id: JobId::from(id),
                kind,
                payload,
                submitted_at,
            },
            token,
            attempt: u32::try_from(attempts).unwrap_or(0),
            worker_id: worker_id.to_string(),
        }))
    }

    #[instrument(skip(self, lease, result), fields(job_id = %lease.job_id()))]
    async fn complete(
        &self,
        lease: &Lease,
        result: serde_json::Value,
    ) -> Result<bool, BrokerError> {
        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'success',
                result = $2,
                lease_token = NULL,
                lease_expires_at = NULL,
                finished_at = now(),
                expires_at = now() + make_interval(secs => $3)
            WHERE id = $1
              AND status NOT IN ('success', 'failure')
            "#,
        )
        .bind(lease.job_id().as_str())
        .bind(&result)
        .bind(self.result_ttl_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    #[instrument(skip(self, lease, error), fields(job_id = %lease.job_id()))]
    async fn fail(&self, lease: &Lease, error: &JobError) -> Result<FailDisposition, BrokerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (String, i32, Option<Uuid>)>(
            "SELECT status, attempts, lease_token FROM job_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(lease.job_id().as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, attempts, lease_token)) = row else {
            return Ok(FailDisposition::Discarded);
        };
        if parse_status(&status)?.is_terminal() || lease_token != Some(lease.token) {
            return Ok(FailDisposition::Discarded);
        }

        let disposition = if error.retryable && attempts < self.max_attempts {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'retry',
                    lease_token = NULL,
                    lease_expires_at = NULL,
                    visible_at = now() + make_interval(secs => $2),
                    failure_kind = $3,
                    failure_message = $4
                WHERE id = $1
                "#,
            )
            .bind(lease.job_id().as_str())
            .bind(self.retry_delay_secs)
            .bind(error.kind.as_str())
            .bind(&error.message)
            .execute(&mut *tx)
            .await?;

            FailDisposition::Retrying {
                attempt: u32::try_from(attempts).unwrap_or(0),
            }
        } else {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'failure',
                    lease_token = NULL,
                    lease_expires_at = NULL,
                    failure_kind = $2,
                    failure_message = $3,
                    finished_at = now(),
                    expires_at = now() + make_interval(secs => $4)
                WHERE id = $1
                "#,
            )
            .bind(lease.job_id().as_str())
            .bind(error.kind.as_str())
            .bind(&error.message)
            .bind(self.result_ttl_secs)
            .execute(&mut *tx)
            .await?;

            FailDisposition::Terminal
        };

        tx.commit().await?;
        Ok(disposition)
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus, BrokerError> {
        self.maintain().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_queue WHERE id = $1")
                .bind(job_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(raw) => parse_status(&raw),
            None => Ok(JobStatus::Unknown),
        }
    }

    async fn fetch(&self, job_id: &JobId) -> Result<FetchOutcome, BrokerError> {
        self.maintain().await?;

        let row = sqlx::query_as::<
            _,
            (String, Option<serde_json::Value>, Option<String>, Option<String>),
        >(
            "SELECT status, result, failure_kind, failure_message FROM job_queue WHERE id = $1",
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, result, failure_kind, failure_message)) = row else {
            return Ok(FetchOutcome::Unknown);
        };

        let outcome = match parse_status(&status)? {
            JobStatus::Success => {
                let value = result.ok_or_else(|| {
                    BrokerError::Corrupt(format!("job {job_id} succeeded without a result"))
                })?;
                FetchOutcome::Ready(value)
            }
            JobStatus::Failure => {
                let kind = failure_kind
                    .as_deref()
                    .unwrap_or(FailureKind::Internal.as_str())
                    .parse()
                    .map_err(BrokerError::Corrupt)?;
                FetchOutcome::Failed(JobFailure {
                    kind,
                    message: failure_message.unwrap_or_default(),
                })
            }
            other => FetchOutcome::NotReady(other),
        };
        Ok(outcome)
    }
}
