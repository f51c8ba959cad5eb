//! Job handlers and the registration table workers dispatch through.

use crate::job::{FailureKind, JobDescriptor, JobError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Handler trait for processing jobs of one kind
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job kind this handler is registered under
    fn kind(&self) -> &'static str;

    /// Process a single job, returning the result payload
    async fn handle(&self, job: &JobDescriptor) -> Result<serde_json::Value, JobError>;

    /// Called when processing fails, before the failure is reported to the broker
    async fn on_error(&self, job: &JobDescriptor, error: &JobError) {
        warn!(
            job_id = %job.id,
            kind = %job.kind,
            failure_kind = %error.kind,
            retryable = error.retryable,
            "Job processing failed: {}",
            error.message
        );
    }
}

/// Explicit kind → handler table, built at startup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its kind, replacing any previous one
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        if self
            .handlers
            .insert(handler.kind().to_string(), handler.clone())
            .is_some()
        {
            warn!(kind = handler.kind(), "Replacing previously registered handler");
        }
        self
    }

    /// Builder-style registration
    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Route a job to its handler. An unregistered kind is a fatal failure.
    pub async fn dispatch(&self, job: &JobDescriptor) -> Result<serde_json::Value, JobError> {
        let Some(handler) = self.get(&job.kind) else {
            return Err(JobError::fatal(
                FailureKind::UnknownJobKind,
                format!("no handler registered for kind '{}'", job.kind),
            ));
        };

        match handler.handle(job).await {
            Ok(value) => Ok(value),
            Err(e) => {
                handler.on_error(job, &e).await;
                Err(e)
            }
        }
    }
}
