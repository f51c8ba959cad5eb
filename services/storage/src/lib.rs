//! Measure Storage
//!
//! Durable storage for the measurement pipeline. Two tiers live here:
//!
//! - **Artifact store**: opaque binary blobs addressed by `(namespace, key)`.
//!   Namespaces separate source images, mask sets and metric sets. Keys are
//!   collision-free (`{job_id}_{yyyyMMddHHmmss}_{kind}`), so the store is
//!   append-only and concurrent writers never target the same key.
//! - **Metadata store**: relational rows linking a job to its owner, its
//!   source image and its result artifacts. Rows are inserted once and never
//!   updated.
//!
//! ## Architecture
//!
//! ```text
//!  Submission                 S3 Bucket                 PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ source image │──────────▶│ source-images│          │ images       │
//! └──────────────┘           │ masks        │          │ jobs         │
//!  Worker                    │ metrics      │          │ predictions  │
//! ┌──────────────┐           └──────────────┘          └──────────────┘
//! │ mask codec   │──────────────────▲                         ▲
//! │ metric codec │                                            │
//! │ result row   │────────────────────────────────────────────┘
//! └──────────────┘
//! ```
//!
//! Both tiers sit behind async traits ([`ArtifactStore`], [`MetadataStore`])
//! with in-memory implementations for tests and single-process runs.

pub mod artifact_store;
pub mod codec;
pub mod config;
pub mod error;
pub mod metadata_store;
pub mod model;
pub mod pg_store;
pub mod s3_store;

pub use artifact_store::{ArtifactStore, MemoryArtifactStore};
pub use codec::{Array, ArrayData, CodecError, DType};
pub use config::{DatabaseConfig, S3Config};
pub use error::StoreError;
pub use metadata_store::{InsertOutcome, MemoryMetadataStore, MetadataStore};
pub use model::{
    artifact_key, ArtifactKind, ImageAsset, JobRecord, Namespace, PredictionResult, Principal,
};
pub use pg_store::PgMetadataStore;
pub use s3_store::S3ArtifactStore;
