/*!
Retention enforcement.
*/

use super::{format_bytes, EngineContext, RunSummary};
use crate::config::StashConfig;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::record::BackupRecord;
use crate::selection::{select_expired, RetentionPolicy};
use crate::storage::ObjectStore;
use crate::{Result, StashError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Options for one cleanup run; `None` fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Single service to clean, or every configured service
    pub service: Option<String>,
    pub max_age_days: Option<i64>,
    pub keep_latest: Option<usize>,
    /// Report what would be deleted without deleting
    pub dry_run: bool,
}

impl CleanupOptions {
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            ..Self::default()
        }
    }
}

/// What a cleanup run deleted (or would delete, in a dry run)
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Services visited, in name order
    pub services: Vec<String>,
    /// Deleted records, oldest first within each service
    pub deleted: Vec<BackupRecord>,
    pub bytes_freed: u64,
    /// Services whose listing or deletion failed
    pub failures: Vec<(String, StashError)>,
    pub dry_run: bool,
}

impl CleanupReport {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            succeeded: self.services.len().saturating_sub(self.failures.len()),
            failed: self.failures.len(),
        }
    }
}

/// Deletes archives that fall outside the retention policy.
pub struct CleanupEngine {
    ctx: EngineContext,
}

impl CleanupEngine {
    pub fn new(config: Arc<StashConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            ctx: EngineContext::new(config, store),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.ctx.notifier = Some(notifier);
        self
    }

    pub(crate) fn from_context(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Apply retention as of now.
    pub async fn run(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        self.run_at(options, Utc::now()).await
    }

    /// Apply retention as of `now`.
    ///
    /// # Errors
    /// [`StashError::Config`] for an unknown service or an invalid policy
    /// override. Per-service store failures are kept in the report.
    pub async fn run_at(
        &self,
        options: &CleanupOptions,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport> {
        let config = &self.ctx.config;
        let policy = config.retention_policy(options.max_age_days, options.keep_latest)?;
        let services = match &options.service {
            Some(name) => {
                config.service(name)?;
                vec![name.clone()]
            }
            None => config.services.keys().cloned().collect(),
        };

        info!(
            services = services.len(),
            max_age_days = policy.max_age_days(),
            keep_latest = policy.keep_latest(),
            dry_run = options.dry_run,
            "Starting cleanup"
        );

        let mut report = CleanupReport {
            dry_run: options.dry_run,
            ..CleanupReport::default()
        };

        for service in &services {
            match self.clean_service(service, &policy, now, options.dry_run).await {
                Ok(expired) => {
                    report.bytes_freed += expired.iter().map(|record| record.size).sum::<u64>();
                    report.deleted.extend(expired);
                }
                Err(err) => {
                    error!(service = %service, error = %err, "Cleanup failed for service");
                    report.failures.push((service.clone(), err));
                }
            }
        }
        report.services = services;

        info!(
            deleted = report.deleted.len(),
            freed = %format_bytes(report.bytes_freed),
            failed = report.failures.len(),
            dry_run = report.dry_run,
            "Cleanup finished"
        );

        if !report.dry_run && (!report.deleted.is_empty() || !report.failures.is_empty()) {
            self.ctx.notify(Self::notification(options, &report)).await;
        }
        Ok(report)
    }

    async fn clean_service(
        &self,
        service: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<BackupRecord>> {
        let prefix = self.ctx.store.codec().service_prefix(service);
        let records = self.ctx.store.list(&prefix).await?;
        let expired = select_expired(&records, policy, now);

        if expired.is_empty() {
            debug!(service = %service, archives = records.len(), "Nothing to delete");
            return Ok(expired);
        }

        if dry_run {
            for record in &expired {
                info!(
                    key = %record.key,
                    timestamp = %record.timestamp,
                    size = %format_bytes(record.size),
                    "[DRY RUN] Would delete archive"
                );
            }
            return Ok(expired);
        }

        let keys: Vec<String> = expired.iter().map(|record| record.key.clone()).collect();
        self.ctx.store.delete_many(&keys).await?;
        info!(service = %service, deleted = keys.len(), "Deleted expired archives");
        Ok(expired)
    }

    fn notification(options: &CleanupOptions, report: &CleanupReport) -> Notification {
        let subject = options.service.clone().unwrap_or_else(|| "all".to_string());
        let kind = if report.failures.is_empty() {
            NotificationKind::Success
        } else {
            NotificationKind::Warning
        };

        let notification = Notification::new(kind, subject, "cleanup")
            .with_detail("Deleted", report.deleted.len())
            .with_detail("Freed", format_bytes(report.bytes_freed));

        if report.failures.is_empty() {
            notification
        } else {
            let failed = report
                .failures
                .iter()
                .map(|(service, err)| format!("{service}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            warn!(failed = report.failures.len(), "Cleanup completed with failures");
            notification.with_error(failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetentionConfig, ServiceSpec};
    use crate::key::{ArchiveFormat, KeyCodec, Timestamp};
    use crate::notify::MockNotificationSink;
    use crate::storage::MockObjectStore;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn codec() -> KeyCodec {
        KeyCodec::new("backups", ArchiveFormat::TarGz)
    }

    fn record(service: &str, timestamp: &str, size: u64) -> BackupRecord {
        let key = codec().encode(service, "data", &Timestamp::parse(timestamp).unwrap());
        let decoded = codec().decode(&key).unwrap();
        BackupRecord::from_decoded(key, decoded, size, None)
    }

    fn config() -> Arc<StashConfig> {
        let services = ["db", "web"]
            .into_iter()
            .map(|name| {
                let root = PathBuf::from(format!("/srv/{name}"));
                let spec = ServiceSpec {
                    paths: BTreeMap::from([("data".to_string(), root)]),
                    ..ServiceSpec::default()
                };
                (name.to_string(), spec)
            })
            .collect();
        Arc::new(StashConfig {
            services,
            retention: RetentionConfig {
                max_age_days: 30,
                keep_latest: 1,
            },
            ..StashConfig::default()
        })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    /// web: two expired plus one protected; db: one expired plus one protected
    fn store() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store.expect_codec().return_const(codec());
        store.expect_list().returning(|prefix| {
            let records = match prefix {
                "backups/web/" => vec![
                    record("web", "20240101-000000", 100),
                    record("web", "20240201-000000", 200),
                    record("web", "20240601-000000", 300),
                ],
                "backups/db/" => vec![
                    record("db", "20240101-000000", 10),
                    record("db", "20240102-000000", 20),
                ],
                _ => Vec::new(),
            };
            Ok(records)
        });
        store
    }

    #[tokio::test]
    async fn test_cleanup_all_services() {
        let mut store = store();
        store
            .expect_delete_many()
            .withf(|keys: &[String]| keys.len() == 1 && keys[0].starts_with("backups/db/"))
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_delete_many()
            .withf(|keys: &[String]| {
                keys == [
                    "backups/web/data/20240101-000000.tar.gz".to_string(),
                    "backups/web/data/20240201-000000.tar.gz".to_string(),
                ]
            })
            .times(1)
            .returning(|_| Ok(()));

        let engine = CleanupEngine::new(config(), Arc::new(store));
        let report = engine.run_at(&CleanupOptions::default(), now()).await.unwrap();

        assert_eq!(report.services, vec!["db".to_string(), "web".to_string()]);
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.bytes_freed, 310);
        assert!(report.failures.is_empty());
        assert!(report.summary().is_success());
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let mut store = store();
        store.expect_delete_many().times(0);

        let mut sink = MockNotificationSink::new();
        sink.expect_deliver().times(0);

        let engine = CleanupEngine::new(config(), Arc::new(store)).with_notifier(Arc::new(sink));
        let options = CleanupOptions {
            dry_run: true,
            ..CleanupOptions::for_service("web")
        };
        let report = engine.run_at(&options, now()).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.bytes_freed, 300);
    }

    #[tokio::test]
    async fn test_one_service_failure_does_not_block_others() {
        let mut store = store();
        store
            .expect_delete_many()
            .withf(|keys: &[String]| keys[0].starts_with("backups/db/"))
            .returning(|_| Err(StashError::network("connection reset")));
        store
            .expect_delete_many()
            .withf(|keys: &[String]| keys[0].starts_with("backups/web/"))
            .times(1)
            .returning(|_| Ok(()));

        let mut sink = MockNotificationSink::new();
        sink.expect_deliver()
            .withf(|n: &Notification| n.kind == NotificationKind::Warning && n.error.is_some())
            .times(1)
            .returning(|_| Ok(()));

        let engine = CleanupEngine::new(config(), Arc::new(store)).with_notifier(Arc::new(sink));
        let report = engine.run_at(&CleanupOptions::default(), now()).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "db");
        assert_eq!(report.deleted.len(), 2);
        assert!(report.deleted.iter().all(|r| r.service == "web"));
        assert_eq!(report.summary(), RunSummary { succeeded: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_listing_failure_is_recorded() {
        let mut store = MockObjectStore::new();
        store.expect_codec().return_const(codec());
        store
            .expect_list()
            .returning(|_| Err(StashError::storage("access denied")));
        store.expect_delete_many().times(0);

        let engine = CleanupEngine::new(config(), Arc::new(store));
        let report = engine.run_at(&CleanupOptions::default(), now()).await.unwrap();

        assert_eq!(report.failures.len(), 2);
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service_is_rejected_before_listing() {
        let mut store = MockObjectStore::new();
        store.expect_list().times(0);

        let engine = CleanupEngine::new(config(), Arc::new(store));
        let err = engine
            .run_at(&CleanupOptions::for_service("mail"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_override_is_rejected() {
        let engine = CleanupEngine::new(config(), Arc::new(MockObjectStore::new()));
        let options = CleanupOptions {
            max_age_days: Some(0),
            ..CleanupOptions::default()
        };
        assert!(matches!(engine.run_at(&options, now()).await, Err(StashError::Config(_))));
    }

    #[tokio::test]
    async fn test_overrides_replace_configured_policy() {
        let mut store = store();
        store
            .expect_delete_many()
            .withf(|keys: &[String]| keys.len() == 3)
            .times(1)
            .returning(|_| Ok(()));

        let engine = CleanupEngine::new(config(), Arc::new(store));
        let options = CleanupOptions {
            max_age_days: Some(1),
            keep_latest: Some(0),
            ..CleanupOptions::for_service("web")
        };
        let report = engine.run_at(&options, now()).await.unwrap();
        assert_eq!(report.bytes_freed, 600);
    }
}
