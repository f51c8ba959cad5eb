//! Queue configuration module.
//!
//! Defaults follow the broker settings the deployment has always run with:
//! a one hour visibility timeout and a fifteen minute result retention.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// In-process broker; state is lost on restart
    Memory,
    /// Postgres-backed durable broker
    #[default]
    Postgres,
}

/// Job queue and worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker backend
    #[serde(default)]
    pub backend: BrokerBackend,
    /// Seconds a reserved job stays invisible before it is redelivered
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Seconds a terminal result stays in the result channel
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// Number of retries after the first attempt for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before a retried job becomes visible again, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Idle sleep between empty reserve attempts, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of competing workers in the pool
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Bound on the eager (synchronous) wait for a job result, in seconds
    #[serde(default = "default_eager_timeout_secs")]
    pub eager_timeout_secs: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    3600
}

fn default_result_ttl_secs() -> u64 {
    900
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_worker_count() -> usize {
    2
}

fn default_eager_timeout_secs() -> u64 {
    60
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            result_ttl_secs: default_result_ttl_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_count: default_worker_count(),
            eager_timeout_secs: default_eager_timeout_secs(),
        }
    }
}

impl QueueConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.visibility_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.visibility_timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.result_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.result_ttl_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.worker_count".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn eager_timeout(&self) -> Duration {
        Duration::from_secs(self.eager_timeout_secs)
    }

    /// Total deliveries a job may receive (first attempt plus retries)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
