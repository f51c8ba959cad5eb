use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::metadata_store::{InsertOutcome, MetadataStore};
use crate::model::{ImageAsset, JobRecord, PredictionResult};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Metadata store for job, image and prediction rows in PostgreSQL
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running metadata migrations");

        // The queue crate keeps its own migrations in the same database.
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;

        info!("Metadata migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, image), fields(key = %image.key))]
    async fn insert_image(&self, image: &ImageAsset) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO images (key, content_type, size_bytes, uploaded_at, owner_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&image.key)
        .bind(&image.content_type)
        .bind(image.size_bytes)
        .bind(image.uploaded_at)
        .bind(image.owner_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_image(&self, key: &str) -> Result<Option<ImageAsset>, StoreError> {
        let image = sqlx::query_as::<_, ImageAsset>(
            r#"
            SELECT key, content_type, size_bytes, uploaded_at, owner_id
            FROM images
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner_id, source_image_key, submitted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(job.owner_id)
        .bind(&job.source_image_key)
        .bind(job.submitted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, owner_id, source_image_key, submitted_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    #[instrument(skip(self, prediction), fields(job_id = %prediction.job_id))]
    async fn insert_prediction(
        &self,
        prediction: &PredictionResult,
    ) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query_as::<_, PredictionResult>(
            r#"
            INSERT INTO predictions (
                job_id, mask_artifact_key, metric_artifact_key, is_calibrated,
                unit, confidence_threshold, iou_threshold, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING job_id, mask_artifact_key, metric_artifact_key, is_calibrated,
                      unit, confidence_threshold, iou_threshold, created_at
            "#,
        )
        .bind(&prediction.job_id)
        .bind(&prediction.mask_artifact_key)
        .bind(&prediction.metric_artifact_key)
        .bind(prediction.is_calibrated)
        .bind(&prediction.unit)
        .bind(prediction.confidence_threshold)
        .bind(prediction.iou_threshold)
        .bind(prediction.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            debug!(job_id = %row.job_id, "Prediction recorded");
            return Ok(InsertOutcome::Inserted(row));
        }

        // Conflict: another delivery of the same job got there first.
        let existing = self
            .get_prediction(&prediction.job_id)
            .await?
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;

        Ok(InsertOutcome::AlreadyExists(existing))
    }

    async fn get_prediction(&self, job_id: &str) -> Result<Option<PredictionResult>, StoreError> {
        let prediction = sqlx::query_as::<_, PredictionResult>(
            r#"
            SELECT job_id, mask_artifact_key, metric_artifact_key, is_calibrated,
                   unit, confidence_threshold, iou_threshold, created_at
            FROM predictions
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(prediction)
    }

    async fn list_images(&self, owner_id: Uuid) -> Result<Vec<ImageAsset>, StoreError> {
        let images = sqlx::query_as::<_, ImageAsset>(
            r#"
            SELECT key, content_type, size_bytes, uploaded_at, owner_id
            FROM images
            WHERE owner_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(images)
    }

    async fn list_predictions(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<PredictionResult>, StoreError> {
        let predictions = sqlx::query_as::<_, PredictionResult>(
            r#"
            SELECT p.job_id, p.mask_artifact_key, p.metric_artifact_key, p.is_calibrated,
                   p.unit, p.confidence_threshold, p.iou_threshold, p.created_at
            FROM predictions p
            JOIN jobs j ON j.id = p.job_id
            WHERE j.owner_id = $1
            ORDER BY p.created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(predictions)
    }
}
