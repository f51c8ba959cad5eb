//! Measure Worker - segmentation-based size measurement
//!
//! This library turns an uploaded image into per-object size metrics. It
//! handles:
//!
//! - Instance segmentation behind the [`Segmenter`] trait, with a classical
//!   threshold baseline
//! - Calibration against a red circular reference object of known radius
//! - Equivalent diameters, summary statistics and blended volume estimates
//! - Overlay and CDF chart rendering
//! - Artifact and prediction persistence, and reconstruction of results the
//!   queue's result channel has already expired
//! - The client-facing submit/poll/fetch service and its HTTP surface
//!
//! # Example
//!
//! ```rust,no_run
//! use measure_worker::{Calibrator, MeasureParams, MeasurementEngine, ThresholdSegmenter};
//! use measure_storage::{MemoryArtifactStore, MemoryMetadataStore};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = MeasurementEngine::new(
//!     Arc::new(ThresholdSegmenter::default()),
//!     Arc::new(Calibrator::default()),
//!     Arc::new(MemoryArtifactStore::new()),
//!     Arc::new(MemoryMetadataStore::new()),
//!     "pixels",
//! );
//!
//! let bytes = std::fs::read("sample.png")?;
//! let params = MeasureParams { conf: 0.5, iou: 0.5, target_radius: Some(10.0), unit: Some("mm".into()) };
//! let analysis = engine.analyze(&bytes, &params)?;
//! println!("{} objects, p50 = {:.2} {}", analysis.measurement.objects.len(),
//!     analysis.measurement.stats.p50, analysis.measurement.unit);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod calibration;
pub mod chart;
pub mod config;
pub mod engine;
pub mod geometry;
pub mod handler;
pub mod mask;
pub mod measurement;
pub mod render;
pub mod segmentation;
pub mod service;
pub mod stats;
pub mod volume;

// Re-export main types
pub use api::{create_router, start_api_server, AppState};
pub use calibration::{CalibrationConfig, CalibrationReading, Calibrator};
pub use config::{ApiConfig, EngineConfig, Role, ServiceConfig, WorkerConfig};
pub use engine::{MeasureError, MeasureParams, MeasurementEngine, MeasurementPayload};
pub use handler::{MeasureHandler, MeasureJob, MEASURE_JOB_KIND};
pub use mask::{Mask, MaskError};
pub use measurement::{Measurement, ObjectMeasurement};
pub use segmentation::{SegmentationError, Segmenter, SegmenterConfig, ThresholdSegmenter};
pub use service::{JobResult, MeasurementService, ServiceError, ServiceSettings, SubmitRequest};
pub use stats::SummaryStats;
