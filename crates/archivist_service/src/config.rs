//! Service configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or none at all) yields a runnable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use archivist_db::{DbConfig, StoreTimeouts};
use archivist_protocol::defaults;
use serde::{Deserialize, Serialize};

use crate::retention::{DataType, RetentionPolicy};

/// Main configuration for the service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// [database]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Zero disables lifetime eviction.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
    /// Zero disables idle eviction.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

fn default_database_url() -> String {
    defaults::DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    defaults::DB_MAX_CONNECTIONS
}

fn default_min_connections() -> u32 {
    defaults::DB_MIN_CONNECTIONS
}

fn default_max_lifetime() -> u64 {
    defaults::DB_MAX_LIFETIME_SECS
}

fn default_idle_timeout() -> u64 {
    defaults::DB_IDLE_TIMEOUT_SECS
}

fn default_acquire_timeout() -> u64 {
    defaults::DB_ACQUIRE_TIMEOUT_SECS
}

fn default_write_timeout() -> u64 {
    defaults::STORE_WRITE_TIMEOUT_SECS
}

fn default_read_timeout() -> u64 {
    defaults::STORE_READ_TIMEOUT_SECS
}

fn default_search_timeout() -> u64 {
    defaults::STORE_SEARCH_TIMEOUT_SECS
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_lifetime_secs: default_max_lifetime(),
            idle_timeout_secs: default_idle_timeout(),
            acquire_timeout_secs: default_acquire_timeout(),
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
            search_timeout_secs: default_search_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Pool and store settings for the connection manager.
    pub fn to_db_config(&self) -> DbConfig {
        let base = DbConfig::from_url(&self.url);
        let secs = |value: u64| (value > 0).then(|| Duration::from_secs(value));
        let timeouts = StoreTimeouts {
            write: Duration::from_secs(self.write_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
            search: Duration::from_secs(self.search_timeout_secs),
        };
        if base.is_memory() {
            return base.with_timeouts(timeouts);
        }
        DbConfig {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            max_lifetime: secs(self.max_lifetime_secs),
            idle_timeout: secs(self.idle_timeout_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            timeouts,
            ..base
        }
    }
}

// ============================================================================
// [broker]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_broker_url() -> String {
    defaults::DEFAULT_BROKER_URL.to_string()
}

fn default_subject() -> String {
    defaults::DEFAULT_SUBJECT.to_string()
}

fn default_queue_group() -> String {
    defaults::DEFAULT_QUEUE_GROUP.to_string()
}

fn default_connect_timeout() -> u64 {
    defaults::BROKER_CONNECT_TIMEOUT_SECS
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            subject: default_subject(),
            queue_group: default_queue_group(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// ============================================================================
// [lifecycle]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// A `processing` LastFile untouched for this long is re-driven on
    /// redelivery.
    #[serde(default = "default_stale_processing")]
    pub stale_processing_secs: u64,
}

fn default_stale_processing() -> u64 {
    defaults::PROCESSING_STALE_SECS
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_processing_secs: default_stale_processing(),
        }
    }
}

impl LifecycleConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_processing_secs.min(u64::from(u32::MAX)) as i64)
    }
}

// ============================================================================
// [retention]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    #[serde(default = "default_policies")]
    pub policies: Vec<RetentionPolicy>,
}

fn default_true() -> bool {
    true
}

fn default_retention_interval() -> u64 {
    defaults::RETENTION_INTERVAL_SECS
}

fn default_batch_limit() -> i64 {
    defaults::RETENTION_BATCH_LIMIT
}

fn default_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy {
            data_type: DataType::LastFiles,
            retention_days: 30,
            archive_first: true,
        },
        RetentionPolicy {
            data_type: DataType::AtlasFiles,
            retention_days: 90,
            archive_first: true,
        },
    ]
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_retention_interval(),
            batch_limit: default_batch_limit(),
            policies: default_policies(),
        }
    }
}

// ============================================================================
// [backup]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_backup_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_backup_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_backup_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_backup_extension")]
    pub file_extension: String,
    /// Dump utility. `{database}` and `{file}` in `dump_args` are substituted.
    #[serde(default = "default_dump_program")]
    pub dump_program: String,
    #[serde(default = "default_dump_args")]
    pub dump_args: Vec<String>,
    #[serde(default = "default_dump_program")]
    pub restore_program: String,
    #[serde(default = "default_restore_args")]
    pub restore_args: Vec<String>,
}

fn default_backup_dir() -> PathBuf {
    archivist_logging::archivist_home()
        .map(|home| home.join("backups"))
        .unwrap_or_else(|_| PathBuf::from("backups"))
}

fn default_backup_interval() -> u64 {
    defaults::BACKUP_INTERVAL_SECS
}

fn default_backup_retention_days() -> u64 {
    defaults::BACKUP_RETENTION_DAYS
}

fn default_backup_prefix() -> String {
    defaults::BACKUP_FILE_PREFIX.to_string()
}

fn default_backup_extension() -> String {
    defaults::BACKUP_FILE_EXTENSION.to_string()
}

fn default_dump_program() -> String {
    "sqlite3".to_string()
}

fn default_dump_args() -> Vec<String> {
    vec!["{database}".to_string(), ".backup '{file}'".to_string()]
}

fn default_restore_args() -> Vec<String> {
    vec!["{database}".to_string(), ".restore '{file}'".to_string()]
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            directory: default_backup_dir(),
            interval_secs: default_backup_interval(),
            retention_days: default_backup_retention_days(),
            file_prefix: default_backup_prefix(),
            file_extension: default_backup_extension(),
            dump_program: default_dump_program(),
            dump_args: default_dump_args(),
            restore_program: default_dump_program(),
            restore_args: default_restore_args(),
        }
    }
}

// ============================================================================
// [analytics]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_analytics_interval")]
    pub interval_secs: u64,
}

fn default_analytics_interval() -> u64 {
    defaults::ANALYTICS_INTERVAL_SECS
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_analytics_interval(),
        }
    }
}
