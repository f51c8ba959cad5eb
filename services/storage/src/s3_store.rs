use crate::artifact_store::ArtifactStore;
use crate::config::S3Config;
use crate::error::StoreError;
use crate::model::Namespace;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// S3-backed artifact store. Namespaces become key prefixes in one bucket:
/// `{namespace}/{key}`.
pub struct S3ArtifactStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

fn unavailable<E: std::error::Error>(context: &str, err: E) -> StoreError {
    StoreError::Unavailable(format!("{context}: {}", DisplayErrorContext(err)))
}

impl S3ArtifactStore {
    /// Create a new S3 artifact store
    pub async fn new(config: &S3Config) -> Result<Self, StoreError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 artifact store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Create the bucket when it does not exist yet
    pub async fn ensure_bucket(&self) -> Result<(), StoreError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| unavailable("Failed to create bucket", e))?;
                info!(bucket = %self.bucket, "Created artifact bucket");
                Ok(())
            }
            Err(e) => Err(unavailable("Failed to check bucket", e)),
        }
    }

    /// Full object key for an artifact
    pub fn object_key(namespace: Namespace, key: &str) -> String {
        format!("{}/{}", namespace.as_str(), sanitize_key(key))
    }

    /// Simple single-part upload for small artifacts
    async fn simple_upload(
        &self,
        object_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| unavailable("Failed to upload artifact to S3", e))?;

        Ok(())
    }

    /// Multipart upload for large artifacts
    async fn multipart_upload(
        &self,
        object_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| unavailable("Failed to create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StoreError::Unavailable("No upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);
        let mut part_number = 1;

        for offset in (0..data.len()).step_by(part_size) {
            let end = (offset + part_size).min(data.len());
            let body = ByteStream::from(data.slice(offset..end));

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| unavailable("Failed to upload part", e))?;

            let completed_part = aws_sdk_s3::types::CompletedPart::builder()
                .part_number(part_number)
                .e_tag(upload_part_response.e_tag().unwrap_or_default())
                .build();

            completed_parts.push(completed_part);
            part_number += 1;
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| unavailable("Failed to complete multipart upload", e))?;

        Ok(())
    }

    /// Get the S3 client
    pub fn client(&self) -> &S3Client {
        &self.client
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let object_key = Self::object_key(namespace, key);
        let size = data.len();

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(&object_key, data, content_type).await?;
        } else {
            self.simple_upload(&object_key, data, content_type).await?;
        }

        metrics::counter!("s3.bytes.uploaded", "namespace" => namespace.as_str()).increment(size as u64);
        debug!(object_key = %object_key, size_bytes = size, "Artifact uploaded");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StoreError> {
        let object_key = Self::object_key(namespace, key);

        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StoreError::NotFound {
                        namespace,
                        key: key.to_string(),
                    });
                }
                return Err(unavailable("Failed to download artifact", e));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| unavailable("Failed to read artifact body", e))?;

        Ok(body.into_bytes())
    }

    async fn exists(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(Self::object_key(namespace, key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(unavailable("Failed to check artifact existence", e))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_keys(
        &self,
        namespace: Namespace,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let namespace_prefix = format!("{}/", namespace.as_str());
        let full_prefix = format!("{}{}", namespace_prefix, prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| unavailable("Failed to list artifacts", e))?;

            keys.extend(response.contents().iter().filter_map(|obj| {
                obj.key()
                    .and_then(|k| k.strip_prefix(&namespace_prefix))
                    .map(String::from)
            }));

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}

/// Sanitize an artifact key to prevent path traversal
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .replace("..", "__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            S3ArtifactStore::object_key(Namespace::Masks, "job-1_20240115103045_masks"),
            "masks/job-1_20240115103045_masks"
        );
        assert_eq!(
            S3ArtifactStore::object_key(Namespace::SourceImages, "a"),
            "source-images/a"
        );
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("job-1_2024_masks"), "job-1_2024_masks");
        assert_eq!(sanitize_key("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_key("hello world"), "hello_world");
    }
}
