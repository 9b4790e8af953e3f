//! Database snapshots through external dump and restore utilities.
//!
//! Snapshots are written as `<prefix>_<YYYYmmdd_HHMMSS>.<ext>` under the
//! backup directory. Their format is whatever the dump utility produces.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::BackupConfig;
use crate::metrics::ServiceMetrics;
use crate::scheduler::PeriodicJob;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    UtilityFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Backup not found: {0}")]
    NotFound(PathBuf),

    #[error("In-memory database cannot be backed up")]
    InMemoryDatabase,
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// An external utility invocation with `{database}` / `{file}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn render(&self, database: &Path, file: &Path) -> Vec<String> {
        let database = database.to_string_lossy();
        let file = file.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{database}", &database).replace("{file}", &file))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub directory: PathBuf,
    pub retention: Duration,
    pub file_prefix: String,
    pub file_extension: String,
    pub dump: CommandTemplate,
    pub restore: CommandTemplate,
}

impl From<&BackupConfig> for BackupSettings {
    fn from(config: &BackupConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            retention: Duration::from_secs(config.retention_days * SECS_PER_DAY),
            file_prefix: config.file_prefix.clone(),
            file_extension: config.file_extension.clone(),
            dump: CommandTemplate::new(&config.dump_program, &config.dump_args),
            restore: CommandTemplate::new(&config.restore_program, &config.restore_args),
        }
    }
}

/// A snapshot file found in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub struct BackupEngine {
    settings: BackupSettings,
    database: Option<PathBuf>,
    metrics: Arc<ServiceMetrics>,
}

impl BackupEngine {
    /// `database` is the file to snapshot; `None` for in-memory databases.
    pub fn new(settings: BackupSettings, database: Option<PathBuf>, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            settings,
            database,
            metrics,
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    fn database(&self) -> Result<&Path> {
        self.database.as_deref().ok_or(BackupError::InMemoryDatabase)
    }

    /// Dump the database into a new timestamped snapshot.
    pub async fn create_backup(&self) -> Result<PathBuf> {
        let database = self.database()?;
        tokio::fs::create_dir_all(&self.settings.directory).await?;
        let target = self.next_backup_path();

        info!(database = %database.display(), file = %target.display(), "Creating backup");
        let args = self.settings.dump.render(database, &target);
        if let Err(e) = run_utility(&self.settings.dump.program, &args).await {
            discard_partial(&target).await;
            return Err(e);
        }
        if !target.exists() {
            return Err(BackupError::UtilityFailed {
                program: self.settings.dump.program.clone(),
                status: "success".to_string(),
                stderr: format!("no snapshot written to {}", target.display()),
            });
        }

        info!(file = %target.display(), "Backup created");
        Ok(target)
    }

    /// Overwrite the database from `path`. Existing data is not preserved.
    pub async fn restore_backup(&self, path: &Path) -> Result<()> {
        let database = self.database()?;
        if !path.is_file() {
            return Err(BackupError::NotFound(path.to_path_buf()));
        }

        warn!(database = %database.display(), file = %path.display(), "Restoring database from backup");
        let args = self.settings.restore.render(database, path);
        run_utility(&self.settings.restore.program, &args).await?;
        info!(file = %path.display(), "Database restored");
        Ok(())
    }

    /// Snapshots with the configured extension, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.settings.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches_extension = path
                .extension()
                .map(|ext| ext == self.settings.file_extension.as_str())
                .unwrap_or(false);
            if !matches_extension {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            backups.push(BackupInfo {
                path,
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(backups)
    }

    pub async fn get_latest_backup(&self) -> Result<Option<BackupInfo>> {
        Ok(self.list_backups().await?.into_iter().next())
    }

    /// Delete snapshots older than the retention window. Returns the removed paths.
    pub async fn prune_backups(&self) -> Result<Vec<PathBuf>> {
        let cutoff = SystemTime::now()
            .checked_sub(self.settings.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = Vec::new();
        for backup in self.list_backups().await? {
            if backup.modified >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(&backup.path).await {
                Ok(()) => {
                    debug!(file = %backup.path.display(), "Pruned backup");
                    removed.push(backup.path);
                }
                Err(e) => warn!(file = %backup.path.display(), error = %e, "Failed to prune backup"),
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Pruned old backups");
        }
        Ok(removed)
    }

    /// Create a snapshot and, only if that worked, prune old ones.
    pub async fn run_cycle(&self) -> Result<PathBuf> {
        let created = match self.create_backup().await {
            Ok(path) => {
                self.metrics.inc_backups_created();
                path
            }
            Err(e) => {
                self.metrics.inc_backups_failed();
                return Err(e);
            }
        };
        let pruned = self.prune_backups().await?;
        self.metrics.add_backups_pruned(pruned.len() as u64);
        Ok(created)
    }

    fn next_backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}_{}", self.settings.file_prefix, stamp);
        let ext = &self.settings.file_extension;

        let mut candidate = self.settings.directory.join(format!("{}.{}", base, ext));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.settings.directory.join(format!("{}_{}.{}", base, n, ext));
            n += 1;
        }
        candidate
    }
}

impl PeriodicJob for BackupEngine {
    async fn run_once(&self) {
        if let Err(e) = self.run_cycle().await {
            error!(error = %e, "Scheduled backup failed");
        }
    }
}

async fn run_utility(program: &str, args: &[String]) -> Result<()> {
    debug!(program, ?args, "Running utility");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| BackupError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(BackupError::UtilityFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!(file = %path.display(), "Removed partial backup"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove partial backup"),
    }
}
