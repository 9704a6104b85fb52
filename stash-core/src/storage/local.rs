/*!
Local directory object store.

Keys map onto paths below a base directory. Uploads are written to a
temporary file next to the destination and renamed into place, so a key is
never visible half-written.
*/

use super::{decode_upload_key, staged_len, ObjectReader, ObjectStore};
use crate::key::KeyCodec;
use crate::record::BackupRecord;
use crate::{Result, StashError};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Object store backed by a local directory
///
/// # Example
/// ```rust,no_run
/// use stash_core::key::{ArchiveFormat, KeyCodec};
/// use stash_core::storage::{LocalObjectStore, ObjectStore};
///
/// # async fn run() -> stash_core::Result<()> {
/// let codec = KeyCodec::new("", ArchiveFormat::TarGz);
/// let store = LocalObjectStore::open("/var/backups/stash", codec).await?;
/// for record in store.list("").await? {
///     println!("{} {}", record.key, record.size);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base_dir: PathBuf,
    codec: KeyCodec,
}

impl LocalObjectStore {
    /// Open (creating if needed) the store rooted at `base_dir`.
    ///
    /// # Errors
    /// [`StashError::Connectivity`] if the directory cannot be created or
    /// written to.
    pub async fn open(base_dir: impl AsRef<Path>, codec: KeyCodec) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let probe_dir = base_dir.clone();

        blocking(move || {
            fs::create_dir_all(&probe_dir)?;
            // Writability probe, removed on drop
            tempfile::NamedTempFile::new_in(&probe_dir)?;
            Ok(())
        })
        .await
        .map_err(|e| {
            let base = base_dir.display();
            StashError::connectivity(format!("local store {base} is not usable: {e}"))
        })?;

        info!(base_dir = %base_dir.display(), "Opened local object store");
        Ok(Self { base_dir, codec })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a key to a path, refusing keys that would leave the base dir
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let confined = key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !confined {
            return Err(StashError::storage(format!("invalid object key '{key}'")));
        }
        Ok(self.base_dir.join(relative))
    }
}

/// Run blocking filesystem work off the async executor
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StashError::storage(format!("filesystem task failed: {e}")))?
}

/// Weak integrity tag from modification time and length
fn weak_etag(meta: &fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_secs());
    format!("{mtime:x}-{:x}", meta.len())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    async fn put(&self, key: &str, source: &Path) -> Result<BackupRecord> {
        let dest = self.resolve(key)?;
        let decoded = decode_upload_key(&self.codec, key)?;
        let expected = staged_len(source).await?;
        let source = source.to_path_buf();

        let meta = blocking(move || {
            let parent = dest
                .parent()
                .ok_or_else(|| {
                    StashError::storage(format!("no parent directory for {}", dest.display()))
                })?;
            fs::create_dir_all(parent)?;

            let mut staged = tempfile::NamedTempFile::new_in(parent)?;
            io::copy(&mut File::open(&source)?, staged.as_file_mut())?;
            staged.as_file().sync_all()?;
            staged.persist(&dest).map_err(|e| StashError::Io(e.error))?;
            Ok(fs::metadata(&dest)?)
        })
        .await?;

        if meta.len() != expected {
            return Err(StashError::storage(format!(
                "stored {} bytes for '{key}', expected {expected}",
                meta.len()
            )));
        }

        debug!(key = %key, size = meta.len(), "Stored archive");
        Ok(BackupRecord::from_decoded(key, decoded, meta.len(), Some(weak_etag(&meta))))
    }

    async fn get(&self, key: &str) -> Result<ObjectReader> {
        let path = self.resolve(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StashError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupRecord>> {
        let base_dir = self.base_dir.clone();
        let codec = self.codec.clone();
        let prefix = prefix.to_string();

        blocking(move || {
            let mut records = Vec::new();
            for entry in WalkDir::new(&base_dir).follow_links(false) {
                let entry = entry.map_err(|e| {
                    StashError::storage(format!("failed to list {}: {e}", base_dir.display()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&base_dir) else {
                    continue;
                };
                let Some(key) = relative.to_str().map(|k| k.replace('\\', "/")) else {
                    continue;
                };
                if !key.starts_with(&prefix) {
                    continue;
                }
                let Some(decoded) = codec.decode(&key) else {
                    continue;
                };
                let meta = entry
                    .metadata()
                    .map_err(|e| StashError::storage(format!("failed to stat {key}: {e}")))?;
                let etag = Some(weak_etag(&meta));
                records.push(BackupRecord::from_decoded(key, decoded, meta.len(), etag));
            }
            records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            Ok(records)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Deleted archive");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StashError::storage(format!("failed to delete '{key}': {e}"))),
        }
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for key in keys {
            if let Err(err) = self.delete(key).await {
                failed.push(format!("{key} ({err})"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StashError::storage(format!(
                "failed to delete {} of {} objects: {}",
                failed.len(),
                keys.len(),
                failed.join(", ")
            )))
        }
    }
}
