//! Configuration model for Stash runs
//!
//! The core never reads configuration files itself. Front ends deserialize a
//! [`StashConfig`] (every section has serde defaults), call
//! [`StashConfig::validate`], and hand the value to the engines behind an
//! `Arc`.

use crate::archive::IncludeFilter;
use crate::key::{ArchiveFormat, KeyCodec};
use crate::selection::RetentionPolicy;
use crate::{Result, StashError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3 or an S3-compatible service
    #[default]
    S3,
    /// Directory on the local filesystem
    Local,
}

/// Object store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Bucket name (required for the S3 backend)
    pub bucket: Option<String>,
    /// Key prefix under which all archives live; may be empty
    pub prefix: String,
    /// AWS region, defaults to the environment's
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (path-style addressing)
    pub endpoint: Option<String>,
    /// Base directory for the local backend
    pub local_base_path: Option<PathBuf>,
    /// Deadline for a single store request
    pub operation_timeout_secs: u64,
    /// Deadline for the connectivity probe
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            bucket: None,
            prefix: String::new(),
            region: None,
            endpoint: None,
            local_base_path: None,
            operation_timeout_secs: 3600,
            connect_timeout_secs: 10,
        }
    }
}

impl StorageConfig {
    /// S3 configuration for the given bucket
    pub fn s3_with_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            ..Self::default()
        }
    }

    /// Local configuration rooted at `base_path`
    pub fn local(base_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Local,
            local_base_path: Some(base_path.into()),
            ..Self::default()
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        match self.backend {
            StorageBackend::S3 => {
                if self.bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(StashError::config("storage.bucket is required for the s3 backend"));
                }
            }
            StorageBackend::Local => {
                if self.local_base_path.is_none() {
                    return Err(StashError::config(
                        "storage.local_base_path is required for the local backend",
                    ));
                }
            }
        }
        if self.operation_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(StashError::config("storage timeouts must be greater than 0"));
        }
        Ok(())
    }
}

/// One configured service: named roots plus optional include folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// path-name → absolute root directory
    pub paths: BTreeMap<String, PathBuf>,
    /// path-name → include-folder prefixes relative to the root
    pub include_folders: BTreeMap<String, Vec<String>>,
}

impl ServiceSpec {
    pub fn include_filter(&self, path_name: &str) -> IncludeFilter {
        self.include_folders
            .get(path_name)
            .map(IncludeFilter::new)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Archives older than this many days are eligible for deletion
    pub max_age_days: i64,
    /// Newest archives per path that are never deleted
    pub keep_latest: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            keep_latest: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory for scratch archives, defaults to the system temp dir
    pub temp_dir: Option<PathBuf>,
    pub preserve_acls: bool,
    pub compression: bool,
    /// Gzip level 0-9
    pub compression_level: u32,
    /// Smallest acceptable archive in bytes; 0 disables the check
    pub min_size: u64,
    /// Paths of one service archived concurrently
    pub parallelism: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            preserve_acls: false,
            compression: true,
            compression_level: crate::compression::DEFAULT_LEVEL,
            min_size: 0,
            parallelism: 1,
        }
    }
}

/// Which notification kinds are delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub on_success: bool,
    pub on_error: bool,
    pub on_warning: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            on_success: true,
            on_error: true,
            on_warning: true,
        }
    }
}

/// Complete configuration of a Stash deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    pub storage: StorageConfig,
    pub services: BTreeMap<String, ServiceSpec>,
    pub retention: RetentionConfig,
    /// Run a cleanup pass for the service after each successful backup
    pub auto_cleanup: bool,
    pub backup: BackupConfig,
    pub notifications: NotificationConfig,
}

/// Non-empty and not a `.`/`..` navigation component
fn is_key_segment(segment: &str) -> bool {
    !matches!(segment, "" | "." | "..")
}

impl StashConfig {
    /// Check the configuration before any store or filesystem work happens.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;

        if self.services.is_empty() {
            return Err(StashError::config("at least one service must be configured"));
        }
        for (name, service) in &self.services {
            if name.contains('/') || !is_key_segment(name) {
                return Err(StashError::config(format!("invalid service name '{name}'")));
            }
            if service.paths.is_empty() {
                return Err(StashError::config(format!(
                    "service {name} must have at least one path configured"
                )));
            }
            for (path_name, root) in &service.paths {
                if !path_name.split('/').all(is_key_segment) {
                    return Err(StashError::config(format!(
                        "service {name} has invalid path name '{path_name}'"
                    )));
                }
                if !root.is_absolute() {
                    return Err(StashError::config(format!(
                        "service {name} path {path_name} must be an absolute path"
                    )));
                }
            }
            if let Some(unknown) = service
                .include_folders
                .keys()
                .find(|path_name| !service.paths.contains_key(*path_name))
            {
                return Err(StashError::config(format!(
                    "service {name} has include_folders for unknown path '{unknown}'"
                )));
            }
        }

        if self.retention.max_age_days <= 0 {
            return Err(StashError::config("retention.max_age_days must be greater than 0"));
        }
        if self.backup.parallelism == 0 {
            return Err(StashError::config("backup.parallelism must be at least 1"));
        }
        if self.backup.compression_level > 9 {
            return Err(StashError::config("backup.compression_level must be between 0 and 9"));
        }
        Ok(())
    }

    /// Look up a service, failing with a configuration error if it is unknown.
    pub fn service(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .get(name)
            .ok_or_else(|| {
                StashError::config(format!("service '{name}' not found in configuration"))
            })
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        ArchiveFormat::from_compression(self.backup.compression)
    }

    pub fn key_codec(&self) -> KeyCodec {
        KeyCodec::new(&self.storage.prefix, self.archive_format())
    }

    /// Retention policy from configuration, with optional per-run overrides
    pub fn retention_policy(
        &self,
        max_age_days: Option<i64>,
        keep_latest: Option<usize>,
    ) -> Result<RetentionPolicy> {
        RetentionPolicy::new(
            max_age_days.unwrap_or(self.retention.max_age_days),
            keep_latest.unwrap_or(self.retention.keep_latest),
        )
    }

    /// Scratch directory for staged archives
    pub fn temp_dir(&self) -> PathBuf {
        self.backup
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
