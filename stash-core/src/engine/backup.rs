/*!
Backup orchestration.

Every configured path of a service is archived to a scratch file, checked
against the minimum size and uploaded under a fresh key. Paths are isolated
from each other: a failing path is reported in its own [`PathBackup`] and the
remaining paths still run. With `backup.parallelism > 1` up to that many
paths are in flight at once; results always come back in configuration
order.
*/

use super::cleanup::{CleanupEngine, CleanupOptions};
use super::{blocking, format_bytes, EngineContext, RunSummary};
use crate::archive::{ArchiveStats, IncludeFilter, ProgressReporter};
use crate::config::{ServiceSpec, StashConfig};
use crate::key::Timestamp;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::observability::record_archive_size;
use crate::record::BackupRecord;
use crate::storage::ObjectStore;
use crate::{Result, StashError};
use futures::stream::{self, StreamExt};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of backing up one path
#[derive(Debug)]
pub struct PathBackup {
    pub service: String,
    pub path_name: String,
    pub source: PathBuf,
    pub duration: Duration,
    /// Present once the archive was written, even if the upload then failed
    pub stats: Option<ArchiveStats>,
    pub result: Result<BackupRecord>,
}

impl PathBackup {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcome of one service within [`BackupEngine::run_all`]
#[derive(Debug)]
pub struct ServiceBackup {
    pub service: String,
    pub result: Result<Vec<PathBackup>>,
}

impl ServiceBackup {
    /// A structural failure counts as one failed item
    pub fn summary(&self) -> RunSummary {
        match &self.result {
            Ok(paths) => BackupEngine::summarize(paths),
            Err(_) => RunSummary { succeeded: 0, failed: 1 },
        }
    }
}

struct BackupTarget {
    path_name: String,
    root: PathBuf,
    filter: IncludeFilter,
}

/// Archives configured paths and uploads them to the object store.
///
/// # Example
/// ```rust,no_run
/// use stash_core::engine::BackupEngine;
/// use stash_core::storage::connect_store;
/// use stash_core::StashConfig;
/// use std::sync::Arc;
///
/// # async fn run(config: StashConfig) -> stash_core::Result<()> {
/// let store = connect_store(&config).await?;
/// let engine = BackupEngine::new(Arc::new(config), store);
/// let outcomes = engine.run_service("web", &[]).await?;
/// assert!(BackupEngine::summarize(&outcomes).is_success());
/// # Ok(())
/// # }
/// ```
pub struct BackupEngine {
    ctx: EngineContext,
}

impl BackupEngine {
    pub fn new(config: Arc<StashConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            ctx: EngineContext::new(config, store),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.ctx.notifier = Some(notifier);
        self
    }

    /// Report archived files per path as `{service}/{path-name}`
    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.ctx.progress = Some(reporter);
        self
    }

    pub fn summarize(outcomes: &[PathBackup]) -> RunSummary {
        RunSummary::tally(outcomes.iter().map(PathBackup::is_success))
    }

    /// Back up every configured service in name order.
    pub async fn run_all(&self, path_filter: &[String]) -> Vec<ServiceBackup> {
        let mut results = Vec::with_capacity(self.ctx.config.services.len());
        for service in self.ctx.config.services.keys() {
            let result = self.run_service(service, path_filter).await;
            if let Err(err) = &result {
                error!(
                    service = %service,
                    error = %err,
                    fatal = err.is_fatal(),
                    "Backup could not start"
                );
            }
            results.push(ServiceBackup {
                service: service.clone(),
                result,
            });
        }
        results
    }

    /// Back up the paths of `service`, optionally restricted to `path_filter`.
    ///
    /// # Errors
    /// [`StashError::Config`] if the service is unknown or no configured path
    /// is selected. Per-path failures are reported in the returned outcomes.
    pub async fn run_service(
        &self,
        service: &str,
        path_filter: &[String],
    ) -> Result<Vec<PathBackup>> {
        let spec = self.ctx.config.service(service)?;
        let targets = resolve_targets(service, spec, path_filter)?;
        let parallelism = self.ctx.config.backup.parallelism.max(1);

        info!(service = %service, paths = targets.len(), parallelism, "Starting backup");

        let backups = targets
            .into_iter()
            .map(|target| self.backup_path(service, target));
        let outcomes: Vec<PathBackup> = stream::iter(backups)
            .buffered(parallelism)
            .collect()
            .await;

        let summary = Self::summarize(&outcomes);
        info!(service = %service, %summary, "Backup finished");

        if self.ctx.config.auto_cleanup && summary.succeeded > 0 {
            self.auto_cleanup(service).await;
        }
        Ok(outcomes)
    }

    async fn backup_path(&self, service: &str, target: BackupTarget) -> PathBackup {
        let started = Instant::now();
        info!(
            service = %service,
            path = %target.path_name,
            source = %target.root.display(),
            "Backing up path"
        );

        let mut stats = None;
        let result = self.archive_and_upload(service, &target, &mut stats).await;
        let duration = started.elapsed();

        let notification = match &result {
            Ok(record) => {
                info!(
                    service = %service,
                    path = %target.path_name,
                    key = %record.key,
                    size = %format_bytes(record.size),
                    duration_ms = duration.as_millis() as u64,
                    "Path backed up"
                );
                Notification::new(NotificationKind::Success, service, "backup")
                    .with_detail("Key", &record.key)
                    .with_detail("Size", format_bytes(record.size))
            }
            Err(err) => {
                error!(
                    service = %service,
                    path = %target.path_name,
                    error = %err,
                    "Path backup failed"
                );
                Notification::new(NotificationKind::Error, service, "backup").with_error(err)
            }
        };
        self.ctx
            .notify(
                notification
                    .with_detail("Path", &target.path_name)
                    .with_detail("Source", target.root.display())
                    .with_detail("Duration", format!("{:.1}s", duration.as_secs_f64())),
            )
            .await;

        PathBackup {
            service: service.to_string(),
            path_name: target.path_name,
            source: target.root,
            duration,
            stats,
            result,
        }
    }

    async fn archive_and_upload(
        &self,
        service: &str,
        target: &BackupTarget,
        stats: &mut Option<ArchiveStats>,
    ) -> Result<BackupRecord> {
        let codec = self.ctx.store.codec();
        let format = codec.format();
        let key = codec.encode(service, &target.path_name, &Timestamp::now());

        let temp_dir = self.ctx.config.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;
        let staged = tempfile::Builder::new()
            .prefix("stash-")
            .suffix(format.suffix())
            .tempfile_in(&temp_dir)?;

        let archiver = self.ctx.archiver(format, &format!("{service}/{}", target.path_name));
        let compression = archiver.compression().algorithm_name();
        let writer = BufWriter::new(staged.reopen()?);
        let root = target.root.clone();
        let filter = target.filter.clone();
        let written = blocking(move || archiver.create(writer, &root, &filter)).await?;
        *stats = Some(written);

        let size = tokio::fs::metadata(staged.path()).await?.len();
        debug!(
            path = %target.path_name,
            compression,
            files = written.files,
            size,
            "Archive staged"
        );
        let minimum = self.ctx.config.backup.min_size;
        if minimum > 0 && size < minimum {
            return Err(StashError::BelowMinimumSize { actual: size, minimum });
        }
        if written.skipped > 0 {
            warn!(
                path = %target.path_name,
                skipped = written.skipped,
                "Some entries could not be archived"
            );
        }

        let record = self.ctx.store.put(&key, staged.path()).await?;
        record_archive_size(record.size);
        Ok(record)
    }

    async fn auto_cleanup(&self, service: &str) {
        let cleanup = CleanupEngine::from_context(self.ctx.clone());
        match cleanup.run(&CleanupOptions::for_service(service)).await {
            Ok(report) if report.failures.is_empty() => {
                info!(service = %service, deleted = report.deleted.len(), "Auto-cleanup finished");
            }
            Ok(report) => {
                for (_, err) in &report.failures {
                    warn!(service = %service, error = %err, "Auto-cleanup failed");
                }
            }
            Err(err) => warn!(service = %service, error = %err, "Auto-cleanup failed"),
        }
    }
}

fn resolve_targets(
    service: &str,
    spec: &ServiceSpec,
    path_filter: &[String],
) -> Result<Vec<BackupTarget>> {
    for requested in path_filter {
        if !spec.paths.contains_key(requested) {
            warn!(
                service = %service,
                path = %requested,
                "Path not configured for service, skipping"
            );
        }
    }

    let targets: Vec<BackupTarget> = spec
        .paths
        .iter()
        .filter(|(path_name, _)| path_filter.is_empty() || path_filter.contains(path_name))
        .map(|(path_name, root)| BackupTarget {
            path_name: path_name.clone(),
            root: root.clone(),
            filter: spec.include_filter(path_name),
        })
        .collect();

    if targets.is_empty() {
        return Err(StashError::config(format!("no valid paths selected for service '{service}'")));
    }
    Ok(targets)
}
