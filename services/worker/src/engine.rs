//! Measurement engine: segmentation → measurement → calibration → artifacts.
//!
//! The CPU-bound analysis runs on the blocking pool. Persistence writes the
//! mask artifact, then the metric artifact, and only then the prediction row,
//! so a row never references an artifact that was not written.

use crate::calibration::{CalibrationReading, Calibrator};
use crate::chart::render_cdf_chart;
use crate::mask::{masks_from_array, masks_to_array, Mask, MaskError};
use crate::measurement::{measure_masks, Measurement};
use crate::render::{encode_png, overlay_masks, RenderError};
use crate::segmentation::{SegmentationError, Segmenter};
use crate::stats::SummaryStats;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use image::RgbImage;
use measure_queue::{FailureKind, JobError};
use measure_storage::{
    artifact_key, Array, ArtifactKind, ArtifactStore, CodecError, InsertOutcome, MetadataStore,
    Namespace, PredictionResult, StoreError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Content type of encoded array artifacts
pub const ARRAY_CONTENT_TYPE: &str = "application/x-measure-array";

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("No objects detected")]
    NoDetection,

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Source image {key} unavailable: {source}")]
    SourceMissing { key: String, source: StoreError },

    #[error("Artifact write failed: {0}")]
    ArtifactWrite(StoreError),

    #[error("Prediction write failed: {0}")]
    MetadataWrite(StoreError),

    #[error("Stored result for job {job_id} is unreadable: {message}")]
    CorruptResult { job_id: String, message: String },

    #[error("Store read failed: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeasureError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MeasureError::Decode(_) => FailureKind::DecodeError,
            MeasureError::NoDetection => FailureKind::NoDetection,
            MeasureError::Segmentation(_) => FailureKind::SegmentationError,
            MeasureError::SourceMissing { .. } => FailureKind::SourceMissing,
            MeasureError::ArtifactWrite(_) => FailureKind::ArtifactWriteFailure,
            MeasureError::MetadataWrite(_) => FailureKind::MetadataWriteFailure,
            MeasureError::Render(_)
            | MeasureError::CorruptResult { .. }
            | MeasureError::Store(_)
            | MeasureError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Infrastructure failures are retried; engine-local ones are terminal
    pub fn is_retryable(&self) -> bool {
        match self {
            MeasureError::SourceMissing { source, .. }
            | MeasureError::ArtifactWrite(source)
            | MeasureError::MetadataWrite(source)
            | MeasureError::Store(source) => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<MeasureError> for JobError {
    fn from(err: MeasureError) -> Self {
        JobError {
            kind: err.kind(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<image::ImageError> for MeasureError {
    fn from(err: image::ImageError) -> Self {
        MeasureError::Decode(err.to_string())
    }
}

impl From<MaskError> for MeasureError {
    fn from(err: MaskError) -> Self {
        MeasureError::Internal(format!("mask encoding: {err}"))
    }
}

impl From<CodecError> for MeasureError {
    fn from(err: CodecError) -> Self {
        MeasureError::Internal(format!("array encoding: {err}"))
    }
}

/// Thresholds and calibration target for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureParams {
    pub conf: f64,
    pub iou: f64,
    /// Physical radius of the reference object
    #[serde(default)]
    pub target_radius: Option<f64>,
    /// Unit of `target_radius`
    #[serde(default)]
    pub unit: Option<String>,
}

/// Result payload published to the result channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPayload {
    pub job_id: String,
    /// Base64 PNG of the source with masks composited
    pub overlaid_image: String,
    /// Base64 PNG of the diameter CDF
    pub distribution_chart: String,
    pub is_calibrated: bool,
    pub unit: String,
    pub conf: f64,
    pub iou: f64,
    pub stats: SummaryStats,
    /// Ascending
    pub diameters: Vec<f64>,
    /// Same order as `diameters`
    pub volumes: Vec<f64>,
    pub mask_artifact_key: String,
    pub metric_artifact_key: String,
}

/// Output of the CPU-bound stage
pub struct Analysis {
    pub masks: Vec<Mask>,
    pub reading: CalibrationReading,
    pub measurement: Measurement,
    pub overlay_png: Vec<u8>,
    pub chart_png: Vec<u8>,
}

fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, MeasureError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

fn render(image: &RgbImage, masks: &[Mask], measurement: &Measurement) -> Result<(Vec<u8>, Vec<u8>), MeasureError> {
    let overlay = overlay_masks(image, masks, &mut rand::thread_rng());
    let chart = render_cdf_chart(
        &measurement.diameters(),
        &measurement.stats,
        measurement.is_calibrated,
        &measurement.unit,
    );
    Ok((encode_png(&overlay)?, encode_png(&chart)?))
}

/// Dependency-injected measurement engine, cheap to clone
#[derive(Clone)]
pub struct MeasurementEngine {
    segmenter: Arc<dyn Segmenter>,
    calibrator: Arc<Calibrator>,
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    pixel_unit: String,
}

impl MeasurementEngine {
    pub fn new(
        segmenter: Arc<dyn Segmenter>,
        calibrator: Arc<Calibrator>,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        pixel_unit: impl Into<String>,
    ) -> Self {
        Self {
            segmenter,
            calibrator,
            artifacts,
            metadata,
            pixel_unit: pixel_unit.into(),
        }
    }

    pub fn pixel_unit(&self) -> &str {
        &self.pixel_unit
    }

    /// Decode, segment, measure, calibrate and render. Touches no store.
    pub fn analyze(&self, bytes: &[u8], params: &MeasureParams) -> Result<Analysis, MeasureError> {
        let image = decode_rgb(bytes)?;
        let (width, height) = image.dimensions();

        let masks: Vec<Mask> = self
            .segmenter
            .segment(&image, params.conf, params.iou)?
            .into_iter()
            .map(|m| m.resize_nearest(width, height))
            .collect();
        if masks.is_empty() {
            return Err(MeasureError::NoDetection);
        }
        metrics::counter!("engine.masks.detected").increment(masks.len() as u64);

        let reading = self.calibrator.detect(&image);
        if reading.found {
            metrics::counter!("engine.calibration.found").increment(1);
        } else {
            metrics::counter!("engine.calibration.missed").increment(1);
        }

        let measurement = Measurement::calibrate(
            measure_masks(&masks),
            &reading,
            params.target_radius,
            params.unit.as_deref(),
            &self.pixel_unit,
        )
        .ok_or(MeasureError::NoDetection)?;

        let (overlay_png, chart_png) = render(&image, &masks, &measurement)?;
        Ok(Analysis {
            masks,
            reading,
            measurement,
            overlay_png,
            chart_png,
        })
    }

    async fn analyze_blocking(&self, bytes: Bytes, params: MeasureParams) -> Result<Analysis, MeasureError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.analyze(&bytes, &params))
            .await
            .map_err(|e| MeasureError::Internal(format!("analysis task failed: {e}")))?
    }

    /// Run the full pipeline for a job whose source image is already stored
    #[instrument(skip_all, fields(job_id = %job_id, image_key = %image_key))]
    pub async fn run(
        &self,
        job_id: &str,
        image_key: &str,
        params: &MeasureParams,
    ) -> Result<MeasurementPayload, MeasureError> {
        let bytes = self
            .artifacts
            .get(Namespace::SourceImages, image_key)
            .await
            .map_err(|source| MeasureError::SourceMissing {
                key: image_key.to_string(),
                source,
            })?;

        let analysis = self.analyze_blocking(bytes, params.clone()).await?;
        let prediction = self.persist(job_id, &analysis, params).await?;

        info!(
            objects = analysis.measurement.objects.len(),
            calibrated = analysis.measurement.is_calibrated,
            unit = %analysis.measurement.unit,
            "Measurement complete"
        );
        Ok(payload(
            &prediction,
            &analysis.measurement,
            &analysis.overlay_png,
            &analysis.chart_png,
        ))
    }

    async fn put_artifact(&self, job_id: &str, kind: ArtifactKind, data: Bytes) -> Result<String, MeasureError> {
        let key = artifact_key(job_id, Utc::now(), kind);
        let len = data.len() as u64;
        self.artifacts
            .put(kind.namespace(), &key, data, ARRAY_CONTENT_TYPE)
            .await
            .map_err(MeasureError::ArtifactWrite)?;
        metrics::counter!("artifacts.bytes.written", "kind" => kind.as_str()).increment(len);
        Ok(key)
    }

    /// Write both artifacts, then the prediction row
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn persist(
        &self,
        job_id: &str,
        analysis: &Analysis,
        params: &MeasureParams,
    ) -> Result<PredictionResult, MeasureError> {
        let mask_bytes = masks_to_array(&analysis.masks)?.encode();
        let metric_bytes = analysis.measurement.to_array()?.encode();

        let mask_key = self.put_artifact(job_id, ArtifactKind::Masks, mask_bytes).await?;
        let metric_key = self.put_artifact(job_id, ArtifactKind::Metrics, metric_bytes).await?;

        let row = PredictionResult {
            job_id: job_id.to_string(),
            mask_artifact_key: mask_key,
            metric_artifact_key: metric_key,
            is_calibrated: analysis.measurement.is_calibrated,
            unit: analysis.measurement.unit.clone(),
            confidence_threshold: params.conf,
            iou_threshold: params.iou,
            created_at: Utc::now(),
        };

        match self
            .metadata
            .insert_prediction(&row)
            .await
            .map_err(MeasureError::MetadataWrite)?
        {
            InsertOutcome::Inserted(row) => Ok(row),
            InsertOutcome::AlreadyExists(existing) => {
                warn!("Prediction already recorded by an earlier delivery; keeping it");
                Ok(existing)
            }
        }
    }

    /// Rebuild a result payload from the durable stores.
    ///
    /// `Ok(None)` when no prediction row exists for the job.
    #[instrument(skip(self))]
    pub async fn reconstruct(&self, job_id: &str) -> Result<Option<MeasurementPayload>, MeasureError> {
        let Some(prediction) = self.metadata.get_prediction(job_id).await? else {
            debug!("No durable prediction");
            return Ok(None);
        };
        let Some(job) = self.metadata.get_job(job_id).await? else {
            return Err(MeasureError::CorruptResult {
                job_id: job_id.to_string(),
                message: "prediction has no job record".to_string(),
            });
        };

        let source = self
            .artifacts
            .get(Namespace::SourceImages, &job.source_image_key)
            .await
            .map_err(|source| MeasureError::SourceMissing {
                key: job.source_image_key.clone(),
                source,
            })?;
        let mask_bytes = self
            .artifacts
            .get(Namespace::Masks, &prediction.mask_artifact_key)
            .await?;
        let metric_bytes = self
            .artifacts
            .get(Namespace::Metrics, &prediction.metric_artifact_key)
            .await?;

        let corrupt = |message: String| MeasureError::CorruptResult {
            job_id: job_id.to_string(),
            message,
        };
        let masks = masks_from_array(&Array::decode(&mask_bytes)?).map_err(|e| corrupt(e.to_string()))?;
        let measurement = Measurement::from_array(
            &Array::decode(&metric_bytes)?,
            prediction.is_calibrated,
            &prediction.unit,
        )
        .ok_or_else(|| corrupt("metric artifact is not a non-empty f64[N,3]".to_string()))?;

        let rendered = tokio::task::spawn_blocking(move || {
            let image = decode_rgb(&source)?;
            let (overlay, chart) = render(&image, &masks, &measurement)?;
            Ok::<_, MeasureError>((measurement, overlay, chart))
        })
        .await
        .map_err(|e| MeasureError::Internal(format!("render task failed: {e}")))??;

        let (measurement, overlay, chart) = rendered;
        info!("Reconstructed result from durable store");
        Ok(Some(payload(&prediction, &measurement, &overlay, &chart)))
    }
}

fn payload(
    prediction: &PredictionResult,
    measurement: &Measurement,
    overlay_png: &[u8],
    chart_png: &[u8],
) -> MeasurementPayload {
    MeasurementPayload {
        job_id: prediction.job_id.clone(),
        overlaid_image: STANDARD.encode(overlay_png),
        distribution_chart: STANDARD.encode(chart_png),
        is_calibrated: prediction.is_calibrated,
        unit: prediction.unit.clone(),
        conf: prediction.confidence_threshold,
        iou: prediction.iou_threshold,
        stats: measurement.stats,
        diameters: measurement.diameters(),
        volumes: measurement.volumes(),
        mask_artifact_key: prediction.mask_artifact_key.clone(),
        metric_artifact_key: prediction.metric_artifact_key.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb};
    use measure_storage::{MemoryArtifactStore, MemoryMetadataStore};
    use std::io::Cursor;

    /// Returns fixed masks regardless of input
    pub(crate) struct FixedSegmenter(pub Vec<Mask>);

    impl Segmenter for FixedSegmenter {
        fn segment(&self, _: &RgbImage, _: f64, _: f64) -> Result<Vec<Mask>, SegmentationError> {
            Ok(self.0.clone())
        }
    }

    /// Artifact store that rejects every write
    struct UnavailableArtifacts;

    #[async_trait]
    impl ArtifactStore for UnavailableArtifacts {
        async fn put(&self, _: Namespace, _: &str, _: Bytes, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StoreError> {
            Err(StoreError::NotFound {
                namespace,
                key: key.to_string(),
            })
        }

        async fn exists(&self, _: Namespace, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn list_keys(&self, _: Namespace, _: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn png(image: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    /// Grey scene with a red reference disk of radius 15 at (40, 40)
    pub(crate) fn scene_with_reference() -> RgbImage {
        RgbImage::from_fn(120, 90, |x, y| {
            if (x as f64 - 40.0).powi(2) + (y as f64 - 40.0).powi(2) <= 225.0 {
                Rgb([220, 30, 30])
            } else {
                Rgb([128, 128, 128])
            }
        })
    }

    pub(crate) fn square_masks(sides: &[u32]) -> Vec<Mask> {
        sides
            .iter()
            .map(|&s| Mask::from_fn(120, 90, |x, y| x >= 70 && y >= 10 && x < 70 + s && y < 10 + s))
            .collect()
    }

    fn params(target_radius: Option<f64>, unit: Option<&str>) -> MeasureParams {
        MeasureParams {
            conf: 0.5,
            iou: 0.5,
            target_radius,
            unit: unit.map(str::to_string),
        }
    }

    fn engine(
        masks: Vec<Mask>,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<MemoryMetadataStore>,
    ) -> MeasurementEngine {
        MeasurementEngine::new(
            Arc::new(FixedSegmenter(masks)),
            Arc::new(Calibrator::default()),
            artifacts,
            metadata,
            "pixels",
        )
    }

    async fn store_source(artifacts: &MemoryArtifactStore, key: &str, image: &RgbImage) {
        artifacts
            .put(Namespace::SourceImages, key, Bytes::from(png(image)), "image/png")
            .await
            .unwrap();
    }

    #[test]
    fn test_analyze_calibrates_with_reference() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let engine = engine(square_masks(&[10, 20]), artifacts, Arc::new(MemoryMetadataStore::new()));

        let analysis = engine
            .analyze(&png(&scene_with_reference()), &params(Some(30.0), Some("mm")))
            .unwrap();
        assert!(analysis.reading.found);
        assert!(analysis.measurement.is_calibrated);
        assert_eq!(analysis.measurement.unit, "mm");

        // Reference radius ≈ 15 px for 30 mm, so roughly 2 mm per pixel
        let factor = 30.0 / analysis.reading.pixel_radius;
        let expected = crate::stats::equivalent_diameter(100.0) * factor;
        assert!((analysis.measurement.diameters()[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_requested_unit_without_reference_is_pixels() {
        let engine = engine(
            square_masks(&[10]),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        );
        let grey = RgbImage::from_pixel(120, 90, Rgb([128, 128, 128]));
        let analysis = engine.analyze(&png(&grey), &params(Some(10.0), Some("mm"))).unwrap();
        assert!(!analysis.measurement.is_calibrated);
        assert_eq!(analysis.measurement.unit, "pixels");
    }

    #[test]
    fn test_malformed_image_is_decode_error() {
        let engine = engine(
            square_masks(&[10]),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        );
        let err = engine.analyze(b"not an image", &params(None, None)).err().unwrap();
        assert_eq!(err.kind(), FailureKind::DecodeError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_small_masks_are_resized() {
        let engine = engine(
            vec![Mask::from_fn(60, 45, |x, y| x < 10 && y < 10)],
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        );
        let grey = RgbImage::from_pixel(120, 90, Rgb([128, 128, 128]));
        let analysis = engine.analyze(&png(&grey), &params(None, None)).unwrap();
        assert_eq!(analysis.masks[0].dimensions(), (120, 90));
        assert_eq!(analysis.masks[0].area(), 400);
    }

    #[tokio::test]
    async fn test_run_persists_artifacts_then_row() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        store_source(&artifacts, "job-1_src", &scene_with_reference()).await;
        let engine = engine(square_masks(&[10, 20, 30]), artifacts.clone(), metadata.clone());

        let payload = engine
            .run("job-1", "job-1_src", &params(Some(30.0), Some("mm")))
            .await
            .unwrap();
        assert!(payload.is_calibrated);
        assert_eq!(payload.diameters.len(), 3);
        assert!(STANDARD.decode(&payload.overlaid_image).is_ok());

        let row = metadata.get_prediction("job-1").await.unwrap().unwrap();
        assert_eq!(row.mask_artifact_key, payload.mask_artifact_key);
        assert!(artifacts.exists(Namespace::Masks, &row.mask_artifact_key).await.unwrap());
        assert!(artifacts.exists(Namespace::Metrics, &row.metric_artifact_key).await.unwrap());
        assert!(row.mask_artifact_key.starts_with("job-1_"));
        assert!(row.mask_artifact_key.ends_with("_masks"));
    }

    #[tokio::test]
    async fn test_no_detection_writes_nothing() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        store_source(&artifacts, "job-2_src", &scene_with_reference()).await;
        let engine = engine(Vec::new(), artifacts.clone(), metadata.clone());

        let err = engine.run("job-2", "job-2_src", &params(None, None)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoDetection);
        assert!(!err.is_retryable());
        assert!(artifacts.list_keys(Namespace::Masks, "job-2").await.unwrap().is_empty());
        assert!(artifacts.list_keys(Namespace::Metrics, "job-2").await.unwrap().is_empty());
        assert_eq!(metadata.prediction_count(), 0);
    }

    #[tokio::test]
    async fn test_artifact_failure_is_retryable_and_leaves_no_row() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let engine = engine(square_masks(&[10]), Arc::new(UnavailableArtifacts), metadata.clone());
        let grey = RgbImage::from_pixel(120, 90, Rgb([128, 128, 128]));
        let analysis = engine.analyze(&png(&grey), &params(None, None)).unwrap();

        let err = engine
            .persist("job-3", &analysis, &params(None, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ArtifactWriteFailure);
        assert!(err.is_retryable());
        assert_eq!(metadata.prediction_count(), 0);

        let job_error = JobError::from(err);
        assert!(job_error.retryable);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_retried() {
        let engine = engine(
            square_masks(&[10]),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        );
        let err = engine.run("job-4", "absent", &params(None, None)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::SourceMissing);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_redelivery_keeps_first_prediction() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        store_source(&artifacts, "job-5_src", &scene_with_reference()).await;
        let engine = engine(square_masks(&[12]), artifacts, metadata.clone());

        let first = engine.run("job-5", "job-5_src", &params(None, None)).await.unwrap();
        let second = engine.run("job-5", "job-5_src", &params(None, None)).await.unwrap();
        assert_eq!(first.mask_artifact_key, second.mask_artifact_key);
        assert_eq!(metadata.prediction_count(), 1);
    }
}
