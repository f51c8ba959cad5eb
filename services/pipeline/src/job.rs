//! Job model: identifiers, descriptors, states and failure kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Globally unique job identifier, generated at submission time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Observable job state.
///
/// `Unknown` covers both "never seen" and "result expired from the result
/// channel"; the two are indistinguishable at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retry,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Retry => "retry",
            JobStatus::Unknown => "unknown",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failure" => Ok(JobStatus::Failure),
            "retry" => Ok(JobStatus::Retry),
            "unknown" => Ok(JobStatus::Unknown),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Discriminant for terminal failures, surfaced to callers as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DecodeError,
    NoDetection,
    SegmentationError,
    ArtifactWriteFailure,
    MetadataWriteFailure,
    SourceMissing,
    UnknownJobKind,
    LeaseExhausted,
    InvalidPayload,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::DecodeError => "decode_error",
            FailureKind::NoDetection => "no_detection",
            FailureKind::SegmentationError => "segmentation_error",
            FailureKind::ArtifactWriteFailure => "artifact_write_failure",
            FailureKind::MetadataWriteFailure => "metadata_write_failure",
            FailureKind::SourceMissing => "source_missing",
            FailureKind::UnknownJobKind => "unknown_job_kind",
            FailureKind::LeaseExhausted => "lease_exhausted",
            FailureKind::InvalidPayload => "invalid_payload",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "decode_error" => FailureKind::DecodeError,
            "no_detection" => FailureKind::NoDetection,
            "segmentation_error" => FailureKind::SegmentationError,
            "artifact_write_failure" => FailureKind::ArtifactWriteFailure,
            "metadata_write_failure" => FailureKind::MetadataWriteFailure,
            "source_missing" => FailureKind::SourceMissing,
            "unknown_job_kind" => FailureKind::UnknownJobKind,
            "lease_exhausted" => FailureKind::LeaseExhausted,
            "invalid_payload" => FailureKind::InvalidPayload,
            "internal" => FailureKind::Internal,
            other => return Err(format!("unknown failure kind: {other}")),
        };
        Ok(kind)
    }
}

/// Error returned by a job handler
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    /// Whether the queue should redeliver the job
    pub retryable: bool,
}

impl JobError {
    /// A failure that ends the job immediately
    pub fn fatal(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    /// A failure the queue retries up to its bound
    pub fn retryable(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn to_failure(&self) -> JobFailure {
        JobFailure {
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

/// Terminal failure as stored in the result channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Unit of work delivered to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    /// Handler lookup key
    pub kind: String,
    /// Handler-specific payload
    pub payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Create a descriptor with a freshly generated id
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_id(JobId::generate(), kind, payload)
    }

    pub fn with_id(id: JobId, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
            submitted_at: Utc::now(),
        }
    }
}

/// What the result channel holds for a job
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Completed; the handler's result payload
    Ready(serde_json::Value),
    /// Not terminal yet
    NotReady(JobStatus),
    /// Terminal failure with its kind
    Failed(JobFailure),
    /// Never seen, or the retained result has expired
    Unknown,
}

impl FetchOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            FetchOutcome::Ready(_) => JobStatus::Success,
            FetchOutcome::NotReady(status) => *status,
            FetchOutcome::Failed(_) => JobStatus::Failure,
            FetchOutcome::Unknown => JobStatus::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), format!("\"{a}\""));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failure,
            JobStatus::Retry,
            JobStatus::Unknown,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(JobStatus::Success.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn test_failure_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureKind::NoDetection).unwrap(),
            "\"no_detection\""
        );
        assert_eq!(
            "artifact_write_failure".parse::<FailureKind>().unwrap(),
            FailureKind::ArtifactWriteFailure
        );
        assert!("bogus".parse::<FailureKind>().is_err());
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::fatal(FailureKind::NoDetection, "no masks");
        assert_eq!(err.to_string(), "no_detection: no masks");
        assert!(!err.retryable);
        assert!(JobError::retryable(FailureKind::ArtifactWriteFailure, "timeout").retryable);
    }
}
