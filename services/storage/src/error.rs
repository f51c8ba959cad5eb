use crate::codec::CodecError;
use crate::model::Namespace;
use thiserror::Error;

/// Errors raised by the artifact and metadata stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Artifact not found: {namespace}/{key}")]
    NotFound { namespace: Namespace, key: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Artifact encoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("Record serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Missing artifacts and malformed payloads stay missing and malformed;
    /// connectivity problems do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
            ),
            StoreError::Migration(_) => false,
            StoreError::NotFound { .. } | StoreError::Codec(_) | StoreError::Serialization(_) => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Unavailable("timeout".into()).is_retryable());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!StoreError::NotFound {
            namespace: Namespace::Masks,
            key: "k".into()
        }
        .is_retryable());
        assert!(!StoreError::Codec(CodecError::BadMagic).is_retryable());
    }
}
