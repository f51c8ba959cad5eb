//! Worker pool: competing consumers that reserve, dispatch and report jobs.

use crate::broker::{Broker, BrokerError, FailDisposition};
use crate::config::QueueConfig;
use crate::handler::HandlerRegistry;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Pool of workers pulling from one broker
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<HandlerRegistry>, config: QueueConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            broker,
            registry,
            config,
            shutdown_tx,
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal all workers to stop after their current job
    pub fn shutdown(&self) {
        info!("Signaling worker pool shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Spawn `worker_count` workers onto the runtime
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.config.worker_count,
            kinds = ?self.registry.kinds(),
            "Starting worker pool"
        );
        (0..self.config.worker_count)
            .map(|index| {
                let pool = Arc::clone(self);
                let worker_id = format!("worker-{index}");
                let shutdown_rx = self.shutdown_receiver();
                tokio::spawn(async move { pool.run_worker(worker_id, shutdown_rx).await })
            })
            .collect()
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run_worker(self: Arc<Self>, worker_id: String, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Worker started");

        loop {
            let idle = match self.process_one(&worker_id).await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!("Broker error: {}", e);
                    metrics::counter!("queue.broker.errors").increment(1);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            } else if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
        }

        info!("Worker stopped");
    }

    /// Reserve and run at most one job. Returns whether a job was taken.
    pub async fn process_one(&self, worker_id: &str) -> Result<bool, BrokerError> {
        let Some(lease) = self.broker.reserve(worker_id).await? else {
            return Ok(false);
        };

        let job = &lease.descriptor;
        info!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = lease.attempt,
            worker_id,
            "Processing job"
        );
        let started = Instant::now();

        match self.registry.dispatch(job).await {
            Ok(result) => {
                if self.broker.complete(&lease, result).await? {
                    metrics::counter!("queue.jobs.completed").increment(1);
                    info!(job_id = %job.id, "Job completed");
                } else {
                    debug!(job_id = %job.id, "Result dropped, job already terminal");
                }
            }
            Err(e) => match self.broker.fail(&lease, &e).await? {
                FailDisposition::Retrying { attempt } => {
                    metrics::counter!("queue.jobs.retried").increment(1);
                    warn!(job_id = %job.id, attempt, "Job failed, scheduled for retry: {}", e);
                }
                FailDisposition::Terminal => {
                    metrics::counter!("queue.jobs.failed", "kind" => e.kind.as_str()).increment(1);
                    error!(job_id = %job.id, failure_kind = %e.kind, "Job failed: {}", e.message);
                }
                FailDisposition::Discarded => {
                    debug!(job_id = %job.id, "Failure report discarded for stale lease");
                }
            },
        }

        metrics::histogram!("queue.job.duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(true)
    }
}
