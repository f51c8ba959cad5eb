//! Measure Queue - durable job queue for the measurement pipeline
//!
//! This library carries jobs from the submission path to a pool of
//! competing workers. It handles:
//!
//! - Job descriptors and the `Pending → Running → {Success, Failure}` state
//!   machine, with `Retry` for retryable failures up to a bounded count
//! - At-least-once delivery: a lease that outlives the visibility timeout is
//!   redelivered to another worker
//! - An ephemeral result channel whose entries expire after a retention
//!   window, after which the job reports `Unknown`
//! - An explicit handler-registration table mapping job kind to handler
//!
//! # Example
//!
//! ```rust,no_run
//! use measure_queue::{Broker, HandlerRegistry, JobDescriptor, MemoryBroker, QueueConfig, WorkerPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = QueueConfig::default();
//!     let broker = Arc::new(MemoryBroker::new(&config));
//!     let registry = Arc::new(HandlerRegistry::new());
//!
//!     let pool = Arc::new(WorkerPool::new(broker.clone(), registry, config));
//!     let handles = pool.spawn();
//!
//!     let job = JobDescriptor::new("measure", serde_json::json!({}));
//!     broker.enqueue(&job).await?;
//!
//!     pool.shutdown();
//!     for handle in handles {
//!         handle.await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod handler;
pub mod job;
pub mod memory;
pub mod pg_broker;
pub mod worker;

// Re-export main types
pub use broker::{wait_for, Broker, BrokerError, FailDisposition, Lease};
pub use config::{BrokerBackend, ConfigError, QueueConfig};
pub use handler::{HandlerRegistry, JobHandler};
pub use job::{FailureKind, FetchOutcome, JobDescriptor, JobError, JobFailure, JobId, JobStatus};
pub use memory::MemoryBroker;
pub use pg_broker::PgBroker;
pub use worker::WorkerPool;

/// Async trait for job handlers (re-export for convenience)
pub use async_trait::async_trait;
