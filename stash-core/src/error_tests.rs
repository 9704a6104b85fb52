/*!
Tests for error classification and display.
*/

use super::StashError;
use std::io;
use std::path::PathBuf;

#[test]
fn test_stash_error_display() {
    let error = StashError::config("retention must be greater than 0");
    assert_eq!(error.to_string(), "Configuration error: retention must be greater than 0");

    let error = StashError::storage("S3 bucket not found");
    assert_eq!(error.to_string(), "Storage error: S3 bucket not found");

    let error = StashError::BelowMinimumSize { actual: 10, minimum: 1024 };
    assert_eq!(
        error.to_string(),
        "Archive size (10 bytes) is below minimum threshold (1024 bytes)"
    );
}

#[test]
fn test_stash_error_from_io_error() {
    let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
    let error = StashError::from(io_error);

    assert!(matches!(error, StashError::Io(_)));
    assert!(!error.is_transient());
}

#[test]
fn test_transient_classification() {
    assert!(StashError::network("connection reset").is_transient());
    assert!(StashError::Timeout { operation: "put_object", seconds: 5 }.is_transient());

    assert!(!StashError::storage("Access denied").is_transient());
    assert!(!StashError::NotFound("a/b/20240101-000000.tar.gz".into()).is_transient());
    assert!(!StashError::config("unknown service").is_transient());
}

#[test]
fn test_fatal_classification() {
    assert!(StashError::config("unknown service web").is_fatal());
    assert!(StashError::connectivity("cannot access bucket").is_fatal());

    assert!(!StashError::DestinationExists(PathBuf::from("/srv/data")).is_fatal());
    assert!(!StashError::BelowMinimumSize { actual: 1, minimum: 2 }.is_fatal());
}

#[test]
fn test_error_is_send_and_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<StashError>();
    assert_sync::<StashError>();
}
