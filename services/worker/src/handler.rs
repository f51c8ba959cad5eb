//! Queue handler for measurement jobs.

use crate::engine::{MeasureParams, MeasurementEngine};
use async_trait::async_trait;
use measure_queue::{FailureKind, JobDescriptor, JobError, JobHandler};
use serde::{Deserialize, Serialize};

/// Job kind measurement jobs are registered under
pub const MEASURE_JOB_KIND: &str = "measure";

/// Descriptor payload; the image itself stays in the artifact store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureJob {
    pub image_key: String,
    #[serde(flatten)]
    pub params: MeasureParams,
}

pub struct MeasureHandler {
    engine: MeasurementEngine,
}

impl MeasureHandler {
    pub fn new(engine: MeasurementEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for MeasureHandler {
    fn kind(&self) -> &'static str {
        MEASURE_JOB_KIND
    }

    async fn handle(&self, job: &JobDescriptor) -> Result<serde_json::Value, JobError> {
        let request: MeasureJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::fatal(FailureKind::InvalidPayload, e.to_string()))?;

        let payload = self
            .engine
            .run(job.id.as_str(), &request.image_key, &request.params)
            .await?;

        serde_json::to_value(payload).map_err(|e| JobError::fatal(FailureKind::Internal, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibrator;
    use crate::engine::tests::{png, scene_with_reference, square_masks, FixedSegmenter};
    use bytes::Bytes;
    use measure_queue::JobId;
    use measure_storage::{ArtifactStore, MemoryArtifactStore, MemoryMetadataStore, Namespace};
    use serde_json::json;
    use std::sync::Arc;

    fn handler(artifacts: Arc<MemoryArtifactStore>) -> MeasureHandler {
        MeasureHandler::new(MeasurementEngine::new(
            Arc::new(FixedSegmenter(square_masks(&[8, 16]))),
            Arc::new(Calibrator::default()),
            artifacts,
            Arc::new(MemoryMetadataStore::new()),
            "pixels",
        ))
    }

    #[test]
    fn test_payload_shape() {
        let job: MeasureJob = serde_json::from_value(json!({
            "image_key": "k",
            "conf": 0.4,
            "iou": 0.6,
            "unit": "mm"
        }))
        .unwrap();
        assert_eq!(job.params.target_radius, None);
        assert_eq!(job.params.unit.as_deref(), Some("mm"));
    }

    #[tokio::test]
    async fn test_handle_returns_measurement_payload() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts
            .put(
                Namespace::SourceImages,
                "src",
                Bytes::from(png(&scene_with_reference())),
                "image/png",
            )
            .await
            .unwrap();

        let job = JobDescriptor::with_id(
            JobId::from("job-h"),
            MEASURE_JOB_KIND,
            json!({"image_key": "src", "conf": 0.5, "iou": 0.5}),
        );
        let value = handler(artifacts).handle(&job).await.unwrap();
        assert_eq!(value["job_id"], "job-h");
        assert_eq!(value["unit"], "pixels");
        assert_eq!(value["is_calibrated"], false);
        assert_eq!(value["diameters"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_fatal() {
        let job = JobDescriptor::new(MEASURE_JOB_KIND, json!({"conf": "high"}));
        let err = handler(Arc::new(MemoryArtifactStore::new()))
            .handle(&job)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidPayload);
        assert!(!err.retryable);
    }
}
