/*!
Stash CLI - Command-line interface for point-in-time directory backups.

Loads a YAML configuration, connects to the configured object store and
drives the backup, restore, list and cleanup engines. The exit status is
non-zero when any path, archive or service in the run failed.
*/

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use stash_core::observability::{gather_metrics, init_tracing};
use stash_core::{
    connect_store, format_bytes, BackupEngine, BackupRecord, CleanupEngine, CleanupOptions,
    NotificationSink, ObjectStore, ProgressReporter, RestoreEngine, RestoreOptions, RunSummary,
    ServiceBackup, StashConfig, StorageBackend, TracingNotifier,
};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stash")]
#[command(about = "Point-in-time directory backups to S3-compatible object storage")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "STASH_CONFIG", default_value = "stash.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Do not send notifications
    #[arg(long, global = true)]
    no_notify: bool,

    /// Do not show per-file progress
    #[arg(long, global = true)]
    no_progress: bool,

    /// Write Prometheus metrics to this file when the command finishes
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive and upload configured paths
    #[command(group(ArgGroup::new("target").required(true).args(["service", "all"])))]
    Backup {
        /// Service to back up
        #[arg(short, long)]
        service: Option<String>,
        /// Back up every configured service
        #[arg(long)]
        all: bool,
        /// Only back up these path names (repeatable)
        #[arg(short, long = "path")]
        paths: Vec<String>,
    },
    /// Download and extract archives
    Restore {
        /// Service to restore
        #[arg(short, long)]
        service: String,
        /// Backup date: YYYYMMDD or YYYYMMDD-HHMMSS
        #[arg(short, long)]
        date: Option<String>,
        /// With --date, restore only the newest archive of that day
        #[arg(long)]
        latest: bool,
        /// Restore under DIR/<path-name> instead of the configured paths
        #[arg(long = "dest", value_name = "DIR")]
        destination: Option<PathBuf>,
        /// Overwrite existing destinations
        #[arg(short, long)]
        force: bool,
        /// Show what would be restored
        #[arg(long)]
        dry_run: bool,
        /// Restore a local archive file instead of a stored one (requires --dest)
        #[arg(long, value_name = "FILE", requires = "destination")]
        from_local: Option<PathBuf>,
    },
    /// List stored archives
    List {
        /// Only list this service
        #[arg(short, long)]
        service: Option<String>,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete archives outside the retention policy
    Cleanup {
        /// Service to clean, or "all"
        #[arg(short, long, default_value = "all")]
        service: String,
        /// Override retention.max_age_days
        #[arg(long, value_name = "DAYS")]
        older_than: Option<i64>,
        /// Override retention.keep_latest
        #[arg(long, value_name = "N")]
        keep_latest: Option<usize>,
        /// Show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate and print the effective configuration
    Config,
}

#[derive(Tabled)]
struct ArchiveRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Path")]
    path_name: String,
    #[tabled(rename = "Created (UTC)")]
    created: String,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Key")]
    key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json_logs)?;

    let config = Arc::new(load_config(&cli.config)?);
    let notifier: Option<Arc<dyn NotificationSink>> = if cli.no_notify {
        None
    } else {
        Some(Arc::new(TracingNotifier::new(config.notifications.clone())))
    };
    let progress: Option<Arc<dyn ProgressReporter>> =
        if cli.no_progress || cli.json_logs || !std::io::stderr().is_terminal() {
            None
        } else {
            Some(Arc::new(ConsoleProgress))
        };

    let succeeded = match cli.command {
        Commands::Config => {
            show_config(&cli.config, &config);
            true
        }
        command => {
            let store = connect_store(&config)
                .await
                .context("failed to connect to the object store")?;
            run_command(command, config, store, notifier, progress).await?
        }
    };

    if let Some(path) = &cli.metrics_file {
        write_metrics(path)?;
    }

    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn load_config(path: &Path) -> anyhow::Result<StashConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: StashConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run_command(
    command: Commands,
    config: Arc<StashConfig>,
    store: Arc<dyn ObjectStore>,
    notifier: Option<Arc<dyn NotificationSink>>,
    progress: Option<Arc<dyn ProgressReporter>>,
) -> anyhow::Result<bool> {
    match command {
        Commands::Backup { service, all: _, paths } => {
            let mut engine = BackupEngine::new(config, store);
            if let Some(notifier) = notifier {
                engine = engine.with_notifier(notifier);
            }
            if let Some(progress) = progress {
                engine = engine.with_progress(progress);
            }
            backup(&engine, service.as_deref(), &paths).await
        }
        Commands::Restore {
            service,
            date,
            latest,
            destination,
            force,
            dry_run,
            from_local,
        } => {
            let mut engine = RestoreEngine::new(config.clone(), store);
            if let Some(notifier) = notifier {
                engine = engine.with_notifier(notifier);
            }
            if let Some(progress) = progress {
                engine = engine.with_progress(progress);
            }
            config.service(&service)?;

            if let (Some(file), Some(destination)) = (from_local, destination.as_ref()) {
                let stats = engine.restore_archive_file(&file, destination, force, dry_run).await?;
                match stats {
                    Some(stats) => println!(
                        "✓ Restored {} files ({}) to {}",
                        stats.files,
                        format_bytes(stats.bytes),
                        destination.display()
                    ),
                    None => println!(
                        "Would restore {} to {}",
                        file.display(),
                        destination.display()
                    ),
                }
                return Ok(true);
            }

            let options = RestoreOptions {
                service,
                date,
                latest,
                destination,
                force,
                dry_run,
            };
            restore(&engine, &options).await
        }
        Commands::List { service, json } => {
            list(&config, store.as_ref(), service.as_deref(), json).await?;
            Ok(true)
        }
        Commands::Cleanup {
            service,
            older_than,
            keep_latest,
            dry_run,
        } => {
            let mut engine = CleanupEngine::new(config, store);
            if let Some(notifier) = notifier {
                engine = engine.with_notifier(notifier);
            }
            let options = CleanupOptions {
                service: (service != "all").then_some(service),
                max_age_days: older_than,
                keep_latest,
                dry_run,
            };
            cleanup(&engine, &options).await
        }
        Commands::Config => Ok(true),
    }
}

async fn backup(
    engine: &BackupEngine,
    service: Option<&str>,
    paths: &[String],
) -> anyhow::Result<bool> {
    let services = match service {
        Some(service) => vec![ServiceBackup {
            service: service.to_string(),
            result: Ok(engine.run_service(service, paths).await?),
        }],
        None => engine.run_all(paths).await,
    };

    let mut summary = RunSummary::default();
    for backup in &services {
        match &backup.result {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match &outcome.result {
                        Ok(record) => println!(
                            "✓ {}/{}: {} ({}, {:.1}s)",
                            backup.service,
                            outcome.path_name,
                            record.key,
                            format_bytes(record.size),
                            outcome.duration.as_secs_f64()
                        ),
                        Err(e) => println!("✗ {}/{}: {e}", backup.service, outcome.path_name),
                    }
                }
            }
            Err(e) => println!("✗ {}: {e}", backup.service),
        }
        summary.merge(backup.summary());
    }

    info!(%summary, "Backup run complete");
    println!("Backup: {summary}");
    Ok(summary.is_success())
}

async fn restore(engine: &RestoreEngine, options: &RestoreOptions) -> anyhow::Result<bool> {
    let outcomes = engine.run_service(options).await?;

    for outcome in &outcomes {
        let label = format!(
            "{}/{} @ {}",
            outcome.record.service, outcome.record.path_name, outcome.record.timestamp
        );
        match &outcome.result {
            Ok(Some(stats)) => println!(
                "✓ {label} → {} ({} files, {})",
                outcome.destination.display(),
                stats.files,
                format_bytes(stats.bytes)
            ),
            Ok(None) => println!("Would restore {label} → {}", outcome.destination.display()),
            Err(e) => println!("✗ {label}: {e}"),
        }
    }

    let summary = RestoreEngine::summarize(&outcomes);
    println!("Restore: {summary}");
    Ok(summary.is_success())
}

async fn list(
    config: &StashConfig,
    store: &dyn ObjectStore,
    service: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let prefix = match service {
        Some(service) => {
            config.service(service)?;
            store.codec().service_prefix(service)
        }
        None => store.codec().root_prefix(),
    };

    let mut records = store.list(&prefix).await?;
    records.sort_by(|a, b| {
        (&a.service, &a.path_name)
            .cmp(&(&b.service, &b.path_name))
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let now = Utc::now();
    let total: u64 = records.iter().map(|record| record.size).sum();
    let count = records.len();
    let rows: Vec<ArchiveRow> = records
        .into_iter()
        .map(|record| archive_row(record, now))
        .collect();
    println!("{}", Table::new(rows));
    println!("{count} archives, {}", format_bytes(total));
    Ok(())
}

fn archive_row(record: BackupRecord, now: DateTime<Utc>) -> ArchiveRow {
    let created = record.timestamp.to_utc();
    ArchiveRow {
        service: record.service,
        path_name: record.path_name,
        created: created.format("%Y-%m-%d %H:%M:%S").to_string(),
        age: format_age(now - created),
        size: format_bytes(record.size),
        key: record.key,
    }
}

async fn cleanup(engine: &CleanupEngine, options: &CleanupOptions) -> anyhow::Result<bool> {
    let report = engine.run(options).await?;

    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    for record in &report.deleted {
        println!("{verb} {} ({})", record.key, format_bytes(record.size));
    }
    for (service, e) in &report.failures {
        error!(service = %service, error = %e, "Cleanup failed");
        println!("✗ {service}: {e}");
    }
    println!(
        "{verb} {} archives, {} freed",
        report.deleted.len(),
        format_bytes(report.bytes_freed)
    );
    Ok(report.summary().is_success())
}

fn show_config(path: &Path, config: &StashConfig) {
    println!("✓ Configuration {} is valid", path.display());
    println!();
    match config.storage.backend {
        StorageBackend::S3 => {
            println!("Storage: s3");
            println!("  Bucket: {}", config.storage.bucket.as_deref().unwrap_or_default());
            if let Some(region) = &config.storage.region {
                println!("  Region: {region}");
            }
            if let Some(endpoint) = &config.storage.endpoint {
                println!("  Endpoint: {endpoint}");
            }
        }
        StorageBackend::Local => {
            let base = config.storage.local_base_path.as_deref().unwrap_or(Path::new(""));
            println!("Storage: local");
            println!("  Base path: {}", base.display());
        }
    }
    println!("  Prefix: {:?}", config.storage.prefix);

    println!("Services:");
    for (name, service) in &config.services {
        println!("  {name}:");
        for (path_name, root) in &service.paths {
            let filter = service.include_filter(path_name);
            if filter.is_unrestricted() {
                println!("    {path_name}: {}", root.display());
            } else {
                println!(
                    "    {path_name}: {} (only {})",
                    root.display(),
                    filter.terms().join(", ")
                );
            }
        }
    }

    println!(
        "Retention: {} days, keep latest {}{}",
        config.retention.max_age_days,
        config.retention.keep_latest,
        if config.auto_cleanup { ", auto-cleanup" } else { "" }
    );
    let backup = &config.backup;
    println!(
        "Backup: {} (level {}), min size {}, parallelism {}, ACLs {}",
        if backup.compression { "tar.gz" } else { "tar" },
        backup.compression_level,
        format_bytes(backup.min_size),
        backup.parallelism,
        if backup.preserve_acls { "preserved" } else { "ignored" }
    );
}

/// Rewrites a single stderr status line per archive
struct ConsoleProgress;

/// Files between redraws of the status line
const PROGRESS_STEP: u64 = 25;

impl ProgressReporter for ConsoleProgress {
    fn advance(&self, label: &str, done: u64, total: Option<u64>) {
        if done % PROGRESS_STEP == 0 || Some(done) == total {
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "\r{}", progress_line(label, done, total));
            let _ = stderr.flush();
        }
    }

    fn finish(&self, label: &str, done: u64) {
        let _ = writeln!(std::io::stderr().lock(), "\r{}", progress_line(label, done, Some(done)));
    }
}

fn progress_line(label: &str, done: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => {
            let percent = done.min(total) * 100 / total;
            format!("{label}: {done}/{total} files ({percent}%)")
        }
        _ => format!("{label}: {done} files"),
    }
}

fn write_metrics(path: &Path) -> anyhow::Result<()> {
    let text = gather_metrics()?;
    std::fs::write(path, text)
        .with_context(|| format!("failed to write metrics to {}", path.display()))
}

fn format_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes().max(0);
    let (days, hours, minutes) = (minutes / 1440, minutes % 1440 / 60, minutes % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
