use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Artifact namespace. Each maps to its own key prefix in the blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
    SourceImages,
    Masks,
    Metrics,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::SourceImages => "source-images",
            Namespace::Masks => "masks",
            Namespace::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind suffix used when generating artifact keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Source,
    Masks,
    Metrics,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source",
            ArtifactKind::Masks => "masks",
            ArtifactKind::Metrics => "metrics",
        }
    }

    /// Namespace the artifact of this kind is written to
    pub fn namespace(&self) -> Namespace {
        match self {
            ArtifactKind::Source => Namespace::SourceImages,
            ArtifactKind::Masks => Namespace::Masks,
            ArtifactKind::Metrics => Namespace::Metrics,
        }
    }
}

/// Generate an artifact key.
/// Format: {job_id}_{yyyyMMddHHmmss}_{kind}
pub fn artifact_key(job_id: &str, at: DateTime<Utc>, kind: ArtifactKind) -> String {
    format!(
        "{job_id}_{timestamp}_{kind}",
        job_id = job_id,
        timestamp = at.format("%Y%m%d%H%M%S"),
        kind = kind.as_str()
    )
}

/// Authenticated principal, validated once at the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
}

/// Uploaded source image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImageAsset {
    /// Artifact key in the source-images namespace
    pub key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
    pub owner_id: Uuid,
}

/// Durable job record written at submission time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: String,
    pub owner_id: Uuid,
    pub source_image_key: String,
    pub submitted_at: DateTime<Utc>,
}

/// Result row for a successfully completed job (at most one per job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PredictionResult {
    pub job_id: String,
    pub mask_artifact_key: String,
    pub metric_artifact_key: String,
    pub is_calibrated: bool,
    /// Physical unit only when `is_calibrated`, pixel unit otherwise
    pub unit: String,
    pub confidence_threshold: f64,
    pub iou_threshold: f64,
    pub created_at: DateTime<Utc>,
}
