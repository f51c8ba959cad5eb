use crate::error::StoreError;
use crate::model::Namespace;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Binary blob storage addressed by namespace and key
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Keys are unique per write; an existing key is overwritten.
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Fetch an artifact, failing with [`StoreError::NotFound`] when absent
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StoreError>;

    /// Check whether an artifact exists
    async fn exists(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError>;

    /// List keys in a namespace starting with `prefix`
    async fn list_keys(&self, namespace: Namespace, prefix: &str)
        -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredArtifact {
    data: Bytes,
    content_type: String,
}

/// In-process artifact store backed by an ordered map
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<BTreeMap<(Namespace, String), StoredArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type recorded for an artifact
    pub fn content_type(&self, namespace: Namespace, key: &str) -> Option<String> {
        self.objects
            .read()
            .get(&(namespace, key.to_string()))
            .map(|a| a.content_type.clone())
    }

    /// Total number of stored artifacts across namespaces
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.objects.write().insert(
            (namespace, key.to_string()),
            StoredArtifact {
                data,
                content_type: content_type.to_string(),
            },
        );
        debug!(key = %key, "Artifact stored in memory");
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .get(&(namespace, key.to_string()))
            .map(|a| a.data.clone())
            .ok_or_else(|| StoreError::NotFound {
                namespace,
                key: key.to_string(),
            })
    }

    async fn exists(&self, namespace: Namespace, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .objects
            .read()
            .contains_key(&(namespace, key.to_string())))
    }

    async fn list_keys(
        &self,
        namespace: Namespace,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|(ns, key)| *ns == namespace && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryArtifactStore::new();
        store
            .put(Namespace::Masks, "job_1_masks", Bytes::from_static(b"abc"), "application/octet-stream")
            .await
            .unwrap();

        let data = store.get(Namespace::Masks, "job_1_masks").await.unwrap();
        assert_eq!(&data[..], b"abc");
        assert_eq!(
            store.content_type(Namespace::Masks, "job_1_masks").as_deref(),
            Some("application/octet-stream")
        );
    }

    #[tokio::test]
    async fn test_namespaces_are_separate() {
        let store = MemoryArtifactStore::new();
        store
            .put(Namespace::Masks, "k", Bytes::from_static(b"m"), "x")
            .await
            .unwrap();

        assert!(store.exists(Namespace::Masks, "k").await.unwrap());
        assert!(!store.exists(Namespace::Metrics, "k").await.unwrap());
        assert!(matches!(
            store.get(Namespace::Metrics, "k").await,
            Err(StoreError::NotFound { namespace: Namespace::Metrics, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let store = MemoryArtifactStore::new();
        for key in ["a_1_masks", "a_2_masks", "b_1_masks"] {
            store
                .put(Namespace::Masks, key, Bytes::new(), "x")
                .await
                .unwrap();
        }
        store
            .put(Namespace::Metrics, "a_1_metrics", Bytes::new(), "x")
            .await
            .unwrap();

        let keys = store.list_keys(Namespace::Masks, "a_").await.unwrap();
        assert_eq!(keys, vec!["a_1_masks".to_string(), "a_2_masks".to_string()]);
        assert_eq!(store.len(), 4);
    }
}
