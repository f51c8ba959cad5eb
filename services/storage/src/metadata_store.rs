use crate::error::StoreError;
use crate::model::{ImageAsset, JobRecord, PredictionResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Outcome of inserting a prediction row
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The row was written by this call
    Inserted(PredictionResult),
    /// A row for the job already existed; it is returned unchanged
    AlreadyExists(PredictionResult),
}

impl InsertOutcome {
    /// The row that is now durable for the job
    pub fn into_record(self) -> PredictionResult {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::AlreadyExists(r) => r,
        }
    }
}

/// Durable relational records for jobs, images and results.
///
/// Every entity is insert-only. Inserting a second prediction for the same
/// job keeps the first one.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_image(&self, image: &ImageAsset) -> Result<(), StoreError>;

    async fn get_image(&self, key: &str) -> Result<Option<ImageAsset>, StoreError>;

    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn insert_prediction(
        &self,
        prediction: &PredictionResult,
    ) -> Result<InsertOutcome, StoreError>;

    async fn get_prediction(&self, job_id: &str) -> Result<Option<PredictionResult>, StoreError>;

    /// Images uploaded by an owner, newest first
    async fn list_images(&self, owner_id: Uuid) -> Result<Vec<ImageAsset>, StoreError>;

    /// Predictions for jobs submitted by an owner, newest first
    async fn list_predictions(&self, owner_id: Uuid)
        -> Result<Vec<PredictionResult>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    images: HashMap<String, ImageAsset>,
    jobs: HashMap<String, JobRecord>,
    predictions: HashMap<String, PredictionResult>,
}

/// In-process metadata store
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of prediction rows
    pub fn prediction_count(&self) -> usize {
        self.tables.read().predictions.len()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_image(&self, image: &ImageAsset) -> Result<(), StoreError> {
        self.tables
            .write()
            .images
            .entry(image.key.clone())
            .or_insert_with(|| image.clone());
        Ok(())
    }

    async fn get_image(&self, key: &str) -> Result<Option<ImageAsset>, StoreError> {
        Ok(self.tables.read().images.get(key).cloned())
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .jobs
            .entry(job.id.clone())
            .or_insert_with(|| job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.tables.read().jobs.get(job_id).cloned())
    }

    async fn insert_prediction(
        &self,
        prediction: &PredictionResult,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.predictions.get(&prediction.job_id) {
            debug!(job_id = %prediction.job_id, "Prediction already recorded");
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        tables
            .predictions
            .insert(prediction.job_id.clone(), prediction.clone());
        Ok(InsertOutcome::Inserted(prediction.clone()))
    }

    async fn get_prediction(&self, job_id: &str) -> Result<Option<PredictionResult>, StoreError> {
        Ok(self.tables.read().predictions.get(job_id).cloned())
    }

    async fn list_images(&self, owner_id: Uuid) -> Result<Vec<ImageAsset>, StoreError> {
        let mut images: Vec<ImageAsset> = self
            .tables
            .read()
            .images
            .values()
            .filter(|i| i.owner_id == owner_id)
            .cloned()
            .collect();
        images.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(images)
    }

    async fn list_predictions(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<PredictionResult>, StoreError> {
        let tables = self.tables.read();
        let mut predictions: Vec<PredictionResult> = tables
            .predictions
            .values()
            .filter(|p| {
                tables
                    .jobs
                    .get(&p.job_id)
                    .map(|j| j.owner_id == owner_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        predictions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn prediction(job_id: &str, mask_key: &str) -> PredictionResult {
        PredictionResult {
            job_id: job_id.to_string(),
            mask_artifact_key: mask_key.to_string(),
            metric_artifact_key: format!("{job_id}_metrics"),
            is_calibrated: false,
            unit: "pixels".to_string(),
            confidence_threshold: 0.5,
            iou_threshold: 0.5,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_prediction_inserted_at_most_once() {
        let store = MemoryMetadataStore::new();

        let first = store
            .insert_prediction(&prediction("job-1", "first"))
            .await
            .unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = store
            .insert_prediction(&prediction("job-1", "second"))
            .await
            .unwrap();
        let InsertOutcome::AlreadyExists(existing) = second else {
            panic!("duplicate insert must keep the first row");
        };
        assert_eq!(existing.mask_artifact_key, "first");
        assert_eq!(store.prediction_count(), 1);
    }

    #[tokio::test]
    async fn test_list_predictions_by_owner() {
        let store = MemoryMetadataStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let now = Utc::now();

        for (job_id, owner) in [("a1", alice), ("a2", alice), ("b1", bob)] {
            store
                .insert_job(&JobRecord {
                    id: job_id.to_string(),
                    owner_id: owner,
                    source_image_key: format!("{job_id}_source"),
                    submitted_at: now,
                })
                .await
                .unwrap();
        }
        let mut older = prediction("a1", "m");
        older.created_at = now - Duration::minutes(5);
        store.insert_prediction(&older).await.unwrap();
        store.insert_prediction(&prediction("a2", "m")).await.unwrap();
        store.insert_prediction(&prediction("b1", "m")).await.unwrap();

        let listed = store.list_predictions(alice).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|p| p.job_id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
    }

    #[tokio::test]
    async fn test_image_and_job_lookup() {
        let store = MemoryMetadataStore::new();
        let owner = Uuid::new_v4();
        let image = ImageAsset {
            key: "j_20240101000000_source".to_string(),
            content_type: "image/png".to_string(),
            size_bytes: 42,
            uploaded_at: Utc::now(),
            owner_id: owner,
        };
        store.insert_image(&image).await.unwrap();

        assert_eq!(store.get_image(&image.key).await.unwrap(), Some(image.clone()));
        assert_eq!(store.get_job("missing").await.unwrap(), None);
        assert_eq!(store.list_images(owner).await.unwrap(), vec![image]);
    }
}
