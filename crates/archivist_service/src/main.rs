//! Archivist service binary.
//!
//! Usage:
//!     archivist [--config archivist.toml] [serve]
//!     archivist backup create|list|restore <path>
//!     archivist retention apply
//!     archivist stats [--tags N] [--days N]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use archivist_db::ArchiveDb;
use archivist_logging::{init_logging, LogConfig};
use archivist_protocol::defaults::ANALYTICS_STATS_DAYS;
use archivist_service::{
    backup_engine, retention_engine, AnalyticsJob, Service, ServiceConfig, ServiceMetrics,
};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "archivist", about = "LastFile archival service", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "ARCHIVIST_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (overrides [database].url)
    #[arg(long, global = true, env = "ARCHIVIST_DATABASE_URL")]
    database_url: Option<String>,

    /// Broker endpoint (overrides [broker].url)
    #[arg(long, global = true, env = "ARCHIVIST_BROKER_URL")]
    broker_url: Option<String>,

    /// Notification subject (overrides [broker].subject)
    #[arg(long, global = true, env = "ARCHIVIST_SUBJECT")]
    subject: Option<String>,

    /// Consumer group name (overrides [broker].queue_group)
    #[arg(long, global = true, env = "ARCHIVIST_QUEUE_GROUP")]
    queue_group: Option<String>,

    /// Snapshot directory (overrides [backup].directory)
    #[arg(long, global = true, env = "ARCHIVIST_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the listener with retention and backup tasks (default)
    Serve,

    /// Manage database snapshots
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Run retention policies
    Retention {
        #[command(subcommand)]
        action: RetentionAction,
    },

    /// Print success-rate statistics, tag counts and recent daily totals
    Stats {
        /// Number of tags to show
        #[arg(long, default_value = "20")]
        tags: i64,

        /// Number of days of daily totals to show
        #[arg(long, default_value_t = ANALYTICS_STATS_DAYS)]
        days: u32,
    },
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    /// Create a snapshot now and prune expired ones
    Create,
    /// List snapshots, newest first
    List,
    /// Restore the database from a snapshot (overwrites current data)
    Restore { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum RetentionAction {
    /// Apply every configured policy once
    Apply,
}

impl Cli {
    fn load_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(url) = &self.broker_url {
            config.broker.url = url.clone();
        }
        if let Some(subject) = &self.subject {
            config.broker.subject = subject.clone();
        }
        if let Some(group) = &self.queue_group {
            config.broker.queue_group = group.clone();
        }
        if let Some(dir) = &self.backup_dir {
            config.backup.directory = dir.clone();
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig::new("archivist").verbose(cli.verbose)) {
        eprintln!("Warning: failed to initialize logging: {:?}", err);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {}", err);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await,
        Commands::Backup { action } => run_backup(&config, action).await,
        Commands::Retention {
            action: RetentionAction::Apply,
        } => run_retention(&config).await,
        Commands::Stats { tags, days } => print_stats(&config, tags, days).await,
    }
}

async fn serve(config: &ServiceConfig) -> Result<()> {
    let service = Service::start(config).await?;
    shutdown_signal().await;
    info!("Shutdown signal received");
    service.shutdown().await
}

async fn run_backup(config: &ServiceConfig, action: BackupAction) -> Result<()> {
    let db_config = config.database.to_db_config();
    let engine = backup_engine(&db_config, config, Arc::new(ServiceMetrics::new()));

    match action {
        BackupAction::Create => {
            let path = engine.run_cycle().await.context("Backup failed")?;
            println!("{}", path.display());
        }
        BackupAction::List => {
            for backup in engine.list_backups().await? {
                let modified: chrono::DateTime<chrono::Utc> = backup.modified.into();
                println!(
                    "{}  {:>12}  {}",
                    modified.format("%Y-%m-%d %H:%M:%S"),
                    backup.size,
                    backup.path.display()
                );
            }
        }
        BackupAction::Restore { path } => {
            engine.restore_backup(&path).await.context("Restore failed")?;
            println!("Restored {}", path.display());
        }
    }
    Ok(())
}

async fn run_retention(config: &ServiceConfig) -> Result<()> {
    let db = ArchiveDb::open(config.database.to_db_config()).await?;
    let engine = retention_engine(&db, config, Arc::new(ServiceMetrics::new()));

    for report in engine.apply_policies().await {
        println!(
            "{:<12} selected={} archived={} deleted={} skipped={} files={} errors={}",
            report.data_type,
            report.selected,
            report.archived,
            report.deleted,
            report.skipped,
            report.files_removed,
            report.errors
        );
    }
    db.close().await;
    Ok(())
}

async fn print_stats(config: &ServiceConfig, tag_limit: i64, days: u32) -> Result<()> {
    let db = ArchiveDb::open(config.database.to_db_config()).await?;

    let stats = db.last_files().success_rate_stats().await?;
    println!(
        "LastFiles: {}  avg={:.3}  min={:.3}  max={:.3}",
        stats.total, stats.average, stats.minimum, stats.maximum
    );
    for count in db.atlas().tag_counts(tag_limit).await? {
        println!("  {:<32} {}", count.tag, count.count);
    }

    let analytics = AnalyticsJob::new(db.analytics(), Arc::new(ServiceMetrics::new()));
    let now = chrono::Utc::now();
    analytics.refresh_at(now).await?;
    println!("Daily totals:");
    for day in analytics.recent(now, days).await? {
        println!(
            "  {}  received={} archived={} failed={} atlas={} avg={:.3}",
            day.period,
            day.last_files_total,
            day.last_files_archived,
            day.last_files_failed,
            day.atlas_created,
            day.average_success_rate
        );
    }

    db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
