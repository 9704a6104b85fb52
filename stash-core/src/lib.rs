/*!
# Stash Core Engine

Point-in-time directory backups to object storage.

This crate provides the pieces a backup front end composes:

- A tar archiver with optional gzip compression, include-folder filtering
  and permission descriptor preservation
- A deterministic object key scheme (`{prefix}/{service}/{path}/{YYYYMMDD-HHMMSS}.tar.gz`)
- Object store clients for S3-compatible services and local directories
- Pure retention and restore selection over backup records
- Backup, restore and cleanup engines with per-path failure isolation

## Architecture

Engines depend only on the [`ObjectStore`] and [`NotificationSink`] traits,
so storage backends and notification delivery are pluggable. Configuration
is an explicit [`StashConfig`] value passed to each engine; nothing in this
crate reads files or environment variables on its own.

## Usage

```rust,no_run
use stash_core::{connect_store, BackupEngine, CleanupEngine, CleanupOptions, StashConfig};
use std::sync::Arc;

# async fn run(config: StashConfig) -> stash_core::Result<()> {
config.validate()?;
let config = Arc::new(config);
let store = connect_store(&config).await?;

let outcomes = BackupEngine::new(config.clone(), store.clone())
    .run_service("web", &[])
    .await?;
println!("{}", BackupEngine::summarize(&outcomes));

let report = CleanupEngine::new(config, store).run(&CleanupOptions::default()).await?;
println!("deleted {} archives", report.deleted.len());
# Ok(())
# }
```
*/

pub mod archive;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod notify;
pub mod observability;
pub mod record;
pub mod selection;
pub mod storage;

pub use archive::{ArchiveStats, Archiver, ExtractStats, IncludeFilter, ProgressReporter};
pub use config::{StashConfig, StorageBackend, StorageConfig};
pub use engine::{
    format_bytes, BackupEngine, CleanupEngine, CleanupOptions, CleanupReport, PathBackup,
    PathRestore, RestoreEngine, RestoreOptions, RunSummary, ServiceBackup,
};
pub use error::{Result, StashError};
pub use key::{ArchiveFormat, KeyCodec, Timestamp};
pub use notify::{Notification, NotificationKind, NotificationSink, TracingNotifier};
pub use record::BackupRecord;
pub use selection::{select_expired, select_for_restore, RestoreFilter, RetentionPolicy};
pub use storage::{connect_store, ObjectStore};
