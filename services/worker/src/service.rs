//! Client-facing job operations: submit, poll, fetch.
//!
//! Submission stores the source image and durable job records, then enqueues
//! a small descriptor and returns. Fetch reads the broker's result channel
//! first; when the broker no longer knows the job, the result is rebuilt from
//! the durable prediction row and its artifacts.

use crate::engine::{MeasureError, MeasureParams, MeasurementEngine, MeasurementPayload};
use crate::handler::{MeasureJob, MEASURE_JOB_KIND};
use bytes::Bytes;
use chrono::Utc;
use measure_queue::{
    wait_for, Broker, BrokerError, FetchOutcome, JobDescriptor, JobFailure, JobId, JobStatus,
};
use measure_storage::{
    artifact_key, ArtifactKind, ArtifactStore, ImageAsset, JobRecord, MetadataStore, Namespace,
    PredictionResult, Principal, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Measure(#[from] MeasureError),

    #[error("Result payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// What a caller sees for a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Ready(Box<MeasurementPayload>),
    NotReady(JobStatus),
    Failed(JobFailure),
    /// Never completed, or never existed
    Unknown,
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        match self {
            JobResult::Ready(_) => JobStatus::Success,
            JobResult::NotReady(status) => *status,
            JobResult::Failed(_) => JobStatus::Failure,
            JobResult::Unknown => JobStatus::Unknown,
        }
    }
}

/// Submission input; thresholds fall back to the service defaults
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub image: Bytes,
    pub content_type: String,
    pub conf: Option<f64>,
    pub iou: Option<f64>,
    pub target_radius: Option<f64>,
    pub unit: Option<String>,
}

impl SubmitRequest {
    pub fn new(image: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            content_type: content_type.into(),
            conf: None,
            iou: None,
            target_radius: None,
            unit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub default_conf: f64,
    pub default_iou: f64,
    /// Bound on the synchronous wait in [`MeasurementService::submit_and_wait`]
    pub eager_timeout: Duration,
    pub poll_interval: Duration,
}

fn check_threshold(name: &str, value: f64) -> Result<f64, ServiceError> {
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "{name} must be in (0, 1], got {value}"
        )))
    }
}

pub struct MeasurementService {
    broker: Arc<dyn Broker>,
    engine: MeasurementEngine,
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    settings: ServiceSettings,
}

impl MeasurementService {
    pub fn new(
        broker: Arc<dyn Broker>,
        engine: MeasurementEngine,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            broker,
            engine,
            artifacts,
            metadata,
            settings,
        }
    }

    fn params(&self, request: &SubmitRequest) -> Result<MeasureParams, ServiceError> {
        let conf = check_threshold("conf", request.conf.unwrap_or(self.settings.default_conf))?;
        let iou = check_threshold("iou", request.iou.unwrap_or(self.settings.default_iou))?;
        if let Some(radius) = request.target_radius {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(ServiceError::InvalidRequest(format!(
                    "target_radius must be positive, got {radius}"
                )));
            }
        }
        if request.unit.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(ServiceError::InvalidRequest("unit must not be empty".to_string()));
        }
        Ok(MeasureParams {
            conf,
            iou,
            target_radius: request.target_radius,
            unit: request.unit.clone(),
        })
    }

    /// Store the image and job records, enqueue, and return the new job id
    #[instrument(skip_all, fields(owner = %principal.id))]
    pub async fn submit(&self, principal: &Principal, request: SubmitRequest) -> Result<JobId, ServiceError> {
        if request.image.is_empty() {
            return Err(ServiceError::InvalidRequest("image is empty".to_string()));
        }
        let params = self.params(&request)?;

        let job_id = JobId::generate();
        let now = Utc::now();
        let image_key = artifact_key(job_id.as_str(), now, ArtifactKind::Source);
        let size_bytes = request.image.len() as i64;

        self.artifacts
            .put(
                Namespace::SourceImages,
                &image_key,
                request.image,
                &request.content_type,
            )
            .await?;
        self.metadata
            .insert_image(&ImageAsset {
                key: image_key.clone(),
                content_type: request.content_type,
                size_bytes,
                uploaded_at: now,
                owner_id: principal.id,
            })
            .await?;
        self.metadata
            .insert_job(&JobRecord {
                id: job_id.to_string(),
                owner_id: principal.id,
                source_image_key: image_key.clone(),
                submitted_at: now,
            })
            .await?;

        let payload = serde_json::to_value(MeasureJob { image_key, params })?;
        self.broker
            .enqueue(&JobDescriptor::with_id(job_id.clone(), MEASURE_JOB_KIND, payload))
            .await?;

        info!(job_id = %job_id, size_bytes, "Job submitted");
        Ok(job_id)
    }

    /// Non-blocking status. A job the broker has forgotten but that has a
    /// durable prediction reports `Success`.
    pub async fn poll(&self, job_id: &JobId) -> Result<JobStatus, ServiceError> {
        let status = self.broker.status(job_id).await?;
        if status != JobStatus::Unknown {
            return Ok(status);
        }
        let durable = self.metadata.get_prediction(job_id.as_str()).await?;
        Ok(if durable.is_some() {
            JobStatus::Success
        } else {
            JobStatus::Unknown
        })
    }

    pub async fn fetch(&self, job_id: &JobId) -> Result<JobResult, ServiceError> {
        let outcome = self.broker.fetch(job_id).await?;
        self.resolve(job_id, outcome).await
    }

    async fn resolve(&self, job_id: &JobId, outcome: FetchOutcome) -> Result<JobResult, ServiceError> {
        match outcome {
            FetchOutcome::Ready(value) => Ok(JobResult::Ready(Box::new(serde_json::from_value(value)?))),
            FetchOutcome::NotReady(status) => Ok(JobResult::NotReady(status)),
            FetchOutcome::Failed(failure) => Ok(JobResult::Failed(failure)),
            FetchOutcome::Unknown => {
                debug!(job_id = %job_id, "Result not in result channel; trying durable store");
                Ok(match self.engine.reconstruct(job_id.as_str()).await? {
                    Some(payload) => JobResult::Ready(Box::new(payload)),
                    None => JobResult::Unknown,
                })
            }
        }
    }

    /// Submit, then wait up to the eager timeout. An elapsed wait is
    /// reported as not ready; the job keeps running.
    pub async fn submit_and_wait(
        &self,
        principal: &Principal,
        request: SubmitRequest,
    ) -> Result<(JobId, JobResult), ServiceError> {
        let job_id = self.submit(principal, request).await?;
        let result = match wait_for(
            self.broker.as_ref(),
            &job_id,
            self.settings.eager_timeout,
            self.settings.poll_interval,
        )
        .await
        {
            Ok(outcome) => self.resolve(&job_id, outcome).await?,
            Err(BrokerError::Timeout(_)) => JobResult::NotReady(self.broker.status(&job_id).await?),
            Err(e) => return Err(e.into()),
        };
        Ok((job_id, result))
    }

    /// Predictions for the principal's jobs, newest first
    pub async fn history(&self, principal: &Principal) -> Result<Vec<PredictionResult>, ServiceError> {
        Ok(self.metadata.list_predictions(principal.id).await?)
    }

    /// Images the principal has uploaded, newest first
    pub async fn images(&self, principal: &Principal) -> Result<Vec<ImageAsset>, ServiceError> {
        Ok(self.metadata.list_images(principal.id).await?)
    }
}
