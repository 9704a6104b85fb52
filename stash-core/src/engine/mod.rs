/*!
Run orchestration.

Each engine is built from a configuration snapshot, a shared [`ObjectStore`]
and an optional [`NotificationSink`]. Structural problems (unknown service,
invalid options, nothing to do) are returned as `Err` before any item is
attempted; everything that can fail for a single path or archive is kept in
that item's outcome so siblings still run.
*/

pub mod backup;
pub mod cleanup;
pub mod restore;

pub use backup::{BackupEngine, PathBackup, ServiceBackup};
pub use cleanup::{CleanupEngine, CleanupOptions, CleanupReport};
pub use restore::{PathRestore, RestoreEngine, RestoreOptions};

use crate::archive::{platform_permissions, Archiver, ProgressReporter};
use crate::compression::StreamCompression;
use crate::config::StashConfig;
use crate::key::ArchiveFormat;
use crate::notify::{self, Notification, NotificationSink};
use crate::storage::ObjectStore;
use crate::{Result, StashError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Aggregate outcome of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    /// Count outcomes, `true` meaning success
    pub fn tally(outcomes: impl IntoIterator<Item = bool>) -> Self {
        outcomes.into_iter().fold(Self::default(), |mut summary, ok| {
            if ok {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            summary
        })
    }

    /// A run fails iff any item failed
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)
    }
}

/// State shared by all engines
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub config: Arc<StashConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    pub progress: Option<Arc<dyn ProgressReporter>>,
}

impl EngineContext {
    pub fn new(config: Arc<StashConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            notifier: None,
            progress: None,
        }
    }

    pub async fn notify(&self, notification: Notification) {
        notify::send(self.notifier.as_deref(), notification).await;
    }

    /// Archiver for `format`, honouring the compression level and ACL
    /// settings. Progress, when reported, is labelled with `label`.
    pub fn archiver(&self, format: ArchiveFormat, label: &str) -> Archiver {
        let backup = &self.config.backup;
        let compression = StreamCompression::for_format(format, backup.compression_level);
        let mut archiver = Archiver::new(compression);
        if backup.preserve_acls {
            archiver = archiver.with_permissions(platform_permissions());
        }
        if let Some(progress) = &self.progress {
            archiver = archiver.with_progress(progress.clone(), label);
        }
        archiver
    }
}

/// Human-readable byte count using binary units (`1.5 KiB`)
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut divisor = UNIT;
    let mut exponent = 0;
    while bytes / divisor >= UNIT && exponent < PREFIXES.len() - 1 {
        divisor *= UNIT;
        exponent += 1;
    }
    format!("{:.1} {}iB", bytes as f64 / divisor as f64, PREFIXES[exponent])
}

/// Run archive work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StashError::archive(format!("archive task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_summary_tally() {
        let summary = RunSummary::tally([true, false, true]);
        assert_eq!(summary, RunSummary { succeeded: 2, failed: 1 });
        assert!(!summary.is_success());
        assert_eq!(summary.to_string(), "2 succeeded, 1 failed");

        let mut total = RunSummary::tally([true]);
        total.merge(RunSummary::tally(std::iter::empty()));
        assert!(total.is_success());
        assert_eq!(total.succeeded, 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(u64::MAX), "16.0 EiB");
    }
}
