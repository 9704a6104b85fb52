/*!
Backup records: the listing-side view of one uploaded archive generation.
*/

use crate::key::{ArchiveFormat, DecodedKey, Timestamp};
use serde::Serialize;

/// One uploaded archive generation, identified by its object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Configured service the archive belongs to
    pub service: String,

    /// Path-name within the service (may contain `/`)
    pub path_name: String,

    /// Canonical creation time encoded in the key
    pub timestamp: Timestamp,

    /// Full object key; the record's identity
    pub key: String,

    /// Stored object size in bytes
    pub size: u64,

    /// Integrity tag reported by the store (ETag), without quotes
    pub etag: Option<String>,

    /// Container format derived from the key suffix
    pub format: ArchiveFormat,
}

impl BackupRecord {
    /// Build a record from a decoded key and the store's object metadata.
    pub fn from_decoded(
        key: impl Into<String>,
        decoded: DecodedKey,
        size: u64,
        etag: Option<String>,
    ) -> Self {
        Self {
            service: decoded.service,
            path_name: decoded.path_name,
            timestamp: decoded.timestamp,
            key: key.into(),
            size,
            etag: etag.map(|tag| tag.trim_matches('"').to_string()),
            format: decoded.format,
        }
    }

    /// Sort key giving a total, deterministic order across services and paths.
    pub fn sort_key(&self) -> (&str, &str, Timestamp, &str) {
        (&self.service, &self.path_name, self.timestamp, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyCodec;

    #[test]
    fn test_record_from_decoded_key() {
        let codec = KeyCodec::new("backups", ArchiveFormat::TarGz);
        let key = "backups/web/uploads/20240115-120000.tar.gz";
        let decoded = codec.decode(key).unwrap();

        let record = BackupRecord::from_decoded(key, decoded, 4096, Some("\"abc123\"".to_string()));

        assert_eq!(record.service, "web");
        assert_eq!(record.path_name, "uploads");
        assert_eq!(record.timestamp.to_string(), "20240115-120000");
        assert_eq!(record.key, key);
        assert_eq!(record.size, 4096);
        assert_eq!(record.etag.as_deref(), Some("abc123"));
        assert_eq!(record.format, ArchiveFormat::TarGz);
    }
}
