/*!
Object store clients.

The engines only talk to [`ObjectStore`]; backends decide how keys map onto
their storage. Every backend decodes listed keys through the shared
[`KeyCodec`] and silently drops keys it does not recognise, so unrelated
objects under the same prefix are ignored.
*/

#[cfg(feature = "local")]
pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "local")]
pub use local::LocalObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use crate::config::{StashConfig, StorageBackend};
use crate::key::{DecodedKey, KeyCodec};
use crate::record::BackupRecord;
use crate::{Result, StashError};
use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

/// Byte stream of a stored archive
pub type ObjectReader = Pin<Box<dyn tokio::io::AsyncRead + Send>>;

/// Largest number of keys removed by one batch delete request
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Durable key-addressed archive storage.
///
/// Implementations are shared between concurrent tasks and must make
/// uploads atomic: a key is either absent or holds the complete archive.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Codec used to name and recognise archive keys
    fn codec(&self) -> &KeyCodec;

    /// Upload the staged archive at `source` under `key`.
    async fn put(&self, key: &str, source: &Path) -> Result<BackupRecord>;

    /// Open the archive stored under `key`.
    async fn get(&self, key: &str) -> Result<ObjectReader>;

    /// All recognised archives whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BackupRecord>>;

    /// Remove one archive. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove several archives, batching requests where the backend allows.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;
}

/// Build the store selected by `config.storage`, verifying it is reachable.
///
/// # Errors
/// [`StashError::Connectivity`] if the store cannot be reached, and
/// [`StashError::Config`] if the selected backend was not compiled in.
pub async fn connect_store(config: &StashConfig) -> Result<Arc<dyn ObjectStore>> {
    let codec = config.key_codec();
    match config.storage.backend {
        StorageBackend::S3 => {
            #[cfg(feature = "s3")]
            {
                let store = S3ObjectStore::connect(&config.storage, codec).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "s3"))]
            {
                let _ = codec;
                Err(StashError::config("this build does not include the s3 storage backend"))
            }
        }
        StorageBackend::Local => {
            #[cfg(feature = "local")]
            {
                let base = config
                    .storage
                    .local_base_path
                    .as_ref()
                    .ok_or_else(|| {
                        StashError::config("storage.local_base_path is required for the local backend")
                    })?;
                let store = LocalObjectStore::open(base, codec).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "local"))]
            {
                let _ = codec;
                Err(StashError::config("this build does not include the local storage backend"))
            }
        }
    }
}

/// Decode a key about to be written, rejecting anything `list` would ignore.
pub(crate) fn decode_upload_key(codec: &KeyCodec, key: &str) -> Result<DecodedKey> {
    codec
        .decode(key)
        .ok_or_else(|| StashError::storage(format!("'{key}' is not a valid archive key")))
}

/// Check that the staged source exists and return its length.
pub(crate) async fn staged_len(source: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(source).await?;
    if !meta.is_file() {
        return Err(StashError::storage(format!(
            "staged archive {} is not a regular file",
            source.display()
        )));
    }
    Ok(meta.len())
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_local_store() {
        let dir = TempDir::new().unwrap();
        let config = StashConfig {
            storage: StorageConfig::local(dir.path().join("store")),
            ..StashConfig::default()
        };

        let store = connect_store(&config).await.unwrap();
        assert_eq!(store.codec().prefix(), "");
        assert!(store.list("").await.unwrap().is_empty());
        assert!(dir.path().join("store").is_dir());
    }

    #[tokio::test]
    async fn test_connect_local_requires_base_path() {
        let config = StashConfig {
            storage: StorageConfig {
                backend: StorageBackend::Local,
                ..StorageConfig::default()
            },
            ..StashConfig::default()
        };

        let err = connect_store(&config).await.err().unwrap();
        assert!(matches!(err, StashError::Config(_)));
    }
}
