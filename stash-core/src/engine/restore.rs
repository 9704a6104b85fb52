/*!
Restore orchestration.
*/

use super::{blocking, format_bytes, EngineContext, RunSummary};
use crate::archive::{ExtractStats, ProgressReporter};
use crate::config::{ServiceSpec, StashConfig};
use crate::key::ArchiveFormat;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::record::BackupRecord;
use crate::selection::{select_for_restore, RestoreFilter};
use crate::storage::ObjectStore;
use crate::{Result, StashError};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// What to restore and where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub service: String,
    /// `YYYYMMDD` or `YYYYMMDD-HHMMSS`; newest archives when absent
    pub date: Option<String>,
    /// With a day filter, keep only the newest archive of that day
    pub latest: bool,
    /// Restore under `{destination}/{path-name}` instead of the configured roots
    pub destination: Option<PathBuf>,
    /// Extract over existing destinations
    pub force: bool,
    pub dry_run: bool,
}

impl RestoreOptions {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }
}

/// Outcome of restoring one archive
#[derive(Debug)]
pub struct PathRestore {
    pub record: BackupRecord,
    pub destination: PathBuf,
    pub duration: Duration,
    /// `Ok(None)` for a dry run
    pub result: Result<Option<ExtractStats>>,
}

impl PathRestore {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Downloads archives and extracts them into place.
pub struct RestoreEngine {
    ctx: EngineContext,
}

impl RestoreEngine {
    pub fn new(config: Arc<StashConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            ctx: EngineContext::new(config, store),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.ctx.notifier = Some(notifier);
        self
    }

    /// Report extracted files per archive, labelled with its destination
    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.ctx.progress = Some(reporter);
        self
    }

    pub fn summarize(outcomes: &[PathRestore]) -> RunSummary {
        RunSummary::tally(outcomes.iter().map(PathRestore::is_success))
    }

    /// Restore the archives of `options.service` selected by date.
    ///
    /// # Errors
    /// [`StashError::Config`] for an unknown service or malformed date and
    /// [`StashError::NotFound`] when nothing is stored or nothing matches.
    /// Failures of individual archives are reported in the outcomes.
    pub async fn run_service(&self, options: &RestoreOptions) -> Result<Vec<PathRestore>> {
        let service = options.service.as_str();
        let spec = self.ctx.config.service(service)?;
        let filter = RestoreFilter::parse(options.date.as_deref(), options.latest)?;

        let prefix = self.ctx.store.codec().service_prefix(service);
        let records = self.ctx.store.list(&prefix).await?;
        if records.is_empty() {
            return Err(StashError::NotFound(format!("no backups found for service '{service}'")));
        }

        let selected = select_for_restore(&records, &filter);
        if selected.is_empty() {
            return Err(StashError::NotFound(format!(
                "no backups of service '{service}' match {}",
                options.date.as_deref().unwrap_or("the selection")
            )));
        }
        info!(
            service = %service,
            archives = selected.len(),
            dry_run = options.dry_run,
            "Starting restore"
        );

        let mut outcomes = Vec::with_capacity(selected.len());
        for record in selected {
            let Some(destination) = destination_for(spec, options, &record) else {
                warn!(
                    service = %service,
                    path = %record.path_name,
                    "Path not found in current service configuration, skipping"
                );
                continue;
            };
            outcomes.push(self.restore_one(record, destination, options).await);
        }

        info!(service = %service, summary = %Self::summarize(&outcomes), "Restore finished");
        Ok(outcomes)
    }

    async fn restore_one(
        &self,
        record: BackupRecord,
        destination: PathBuf,
        options: &RestoreOptions,
    ) -> PathRestore {
        let started = Instant::now();
        info!(
            key = %record.key,
            destination = %destination.display(),
            size = %format_bytes(record.size),
            "Restoring archive"
        );

        let result = if options.dry_run {
            info!(
                key = %record.key,
                destination = %destination.display(),
                "[DRY RUN] Would restore archive"
            );
            Ok(None)
        } else {
            self.download_and_extract(&record, &destination, options.force)
                .await
                .map(Some)
        };
        let duration = started.elapsed();

        if !options.dry_run {
            let notification = match &result {
                Ok(_) => {
                    info!(
                        key = %record.key,
                        duration_ms = duration.as_millis() as u64,
                        "Archive restored"
                    );
                    Notification::new(NotificationKind::Success, &options.service, "restore")
                }
                Err(err) => {
                    error!(key = %record.key, error = %err, "Restore failed");
                    Notification::new(NotificationKind::Error, &options.service, "restore")
                        .with_error(err)
                }
            };
            self.ctx
                .notify(
                    notification
                        .with_detail("Path", &record.path_name)
                        .with_detail("Restore Path", destination.display())
                        .with_detail(
                            "Backup Date",
                            record.timestamp.to_utc().format("%Y-%m-%d %H:%M:%S"),
                        )
                        .with_detail("Key", &record.key)
                        .with_detail("Duration", format!("{:.1}s", duration.as_secs_f64())),
                )
                .await;
        }

        PathRestore {
            record,
            destination,
            duration,
            result,
        }
    }

    async fn download_and_extract(
        &self,
        record: &BackupRecord,
        destination: &Path,
        force: bool,
    ) -> Result<ExtractStats> {
        ensure_writable(destination, force).await?;

        let temp_dir = self.ctx.config.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("stash-restore-")
            .suffix(record.format.suffix())
            .tempfile_in(&temp_dir)?;

        let deadline = self.ctx.config.storage.operation_timeout();
        let download = async {
            let mut reader = self.ctx.store.get(&record.key).await?;
            let mut file = tokio::fs::File::from_std(scratch.reopen()?);
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok::<_, StashError>(())
        };
        tokio::time::timeout(deadline, download)
            .await
            .map_err(|_| StashError::Timeout {
                operation: "download",
                seconds: deadline.as_secs(),
            })??;

        self.extract_file(scratch.reopen()?, record.format, destination).await
    }

    async fn extract_file(
        &self,
        source: std::fs::File,
        format: ArchiveFormat,
        destination: &Path,
    ) -> Result<ExtractStats> {
        let archiver = self.ctx.archiver(format, &destination.display().to_string());
        let dest = destination.to_path_buf();
        let stats = blocking(move || archiver.extract(BufReader::new(source), &dest)).await?;
        if stats.skipped > 0 {
            warn!(
                destination = %destination.display(),
                skipped = stats.skipped,
                "Some entries were not restored"
            );
        }
        Ok(stats)
    }

    /// Restore a local archive file into `destination`. The format is taken
    /// from the file name (`.tar.gz` or `.tar`).
    ///
    /// # Errors
    /// [`StashError::Config`] for an unrecognised file name,
    /// [`StashError::SourceUnavailable`] if the file cannot be opened and
    /// [`StashError::DestinationExists`] without `force`.
    pub async fn restore_archive_file(
        &self,
        file: &Path,
        destination: &Path,
        force: bool,
        dry_run: bool,
    ) -> Result<Option<ExtractStats>> {
        let format = file
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(ArchiveFormat::strip_suffix)
            .map(|(_, format)| format)
            .ok_or_else(|| {
                StashError::config(format!("{} is not a .tar or .tar.gz archive", file.display()))
            })?;

        let source = std::fs::File::open(file).map_err(|e| StashError::SourceUnavailable {
            path: file.to_path_buf(),
            reason: e.to_string(),
        })?;

        if dry_run {
            info!(
                file = %file.display(),
                destination = %destination.display(),
                "[DRY RUN] Would restore local archive"
            );
            return Ok(None);
        }

        ensure_writable(destination, force).await?;
        info!(
            file = %file.display(),
            destination = %destination.display(),
            "Restoring local archive"
        );
        self.extract_file(source, format, destination).await.map(Some)
    }
}

fn destination_for(
    spec: &ServiceSpec,
    options: &RestoreOptions,
    record: &BackupRecord,
) -> Option<PathBuf> {
    match &options.destination {
        Some(root) => Some(root.join(&record.path_name)),
        None => spec.paths.get(&record.path_name).cloned(),
    }
}

async fn ensure_writable(destination: &Path, force: bool) -> Result<()> {
    if !force && tokio::fs::try_exists(destination).await? {
        return Err(StashError::DestinationExists(destination.to_path_buf()));
    }
    Ok(())
}
