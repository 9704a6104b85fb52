/*!
Error types for the Stash core engine.
*/

use stash_retry::RetryableError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the Stash core.
pub type Result<T> = std::result::Result<T, StashError>;

/// Errors that can occur while archiving, transferring or expiring backups.
#[derive(Error, Debug)]
pub enum StashError {
    /// I/O errors during local file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration or invalid run options; never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// The object store cannot be reached or refuses our credentials
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The root of a path to back up cannot be accessed
    #[error("Source path unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    /// Archive encoding or decoding failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// The staged archive is smaller than the configured minimum
    #[error("Archive size ({actual} bytes) is below minimum threshold ({minimum} bytes)")]
    BelowMinimumSize { actual: u64, minimum: u64 },

    /// Restore target exists and overwriting was not requested
    #[error("Destination path {0} already exists, use force to overwrite")]
    DestinationExists(PathBuf),

    /// Object key is not present in the store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object store rejected the request
    #[error("Storage error: {0}")]
    Storage(String),

    /// Request failed in transit (dispatch failure, 5xx, throttling)
    #[error("Network error: {0}")]
    Network(String),

    /// Operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },
}

impl StashError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connectivity error
    pub fn connectivity<S: Into<String>>(msg: S) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }

    /// Errors that abort a whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Connectivity(_))
    }
}

impl RetryableError for StashError {
    fn is_transient(&self) -> bool {
        StashError::is_transient(self)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
