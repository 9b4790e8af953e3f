//! Connection pool creation.
//!
//! SQLite only. Pragmas go through `SqliteConnectOptions` so every pooled
//! connection gets them, not just the first one.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use archivist_protocol::defaults;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use crate::error::Result;

/// Database pool type alias.
pub type DbPool = sqlx::SqlitePool;

/// Database row type for queries.
pub type DbRow = sqlx::sqlite::SqliteRow;

const MEMORY_URL: &str = "sqlite::memory:";

/// Per-operation deadlines applied by the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    /// Single-row writes and status transitions.
    pub write: Duration,
    /// Point reads and paginated listings.
    pub read: Duration,
    /// Tag searches and aggregates.
    pub search: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_secs(defaults::STORE_WRITE_TIMEOUT_SECS),
            read: Duration::from_secs(defaults::STORE_READ_TIMEOUT_SECS),
            search: Duration::from_secs(defaults::STORE_SEARCH_TIMEOUT_SECS),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection URL (`sqlite:path` or `sqlite::memory:`)
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub acquire_timeout: Duration,
    pub timeouts: StoreTimeouts,
}

impl DbConfig {
    /// Configuration for a URL with the default pool limits.
    ///
    /// Every connection to `:memory:` is a separate database, so in-memory
    /// URLs get a pool pinned to one connection that is never recycled.
    pub fn from_url(url: impl Into<String>) -> Self {
        let config = Self {
            url: url.into(),
            max_connections: defaults::DB_MAX_CONNECTIONS,
            min_connections: defaults::DB_MIN_CONNECTIONS,
            max_lifetime: Some(Duration::from_secs(defaults::DB_MAX_LIFETIME_SECS)),
            idle_timeout: Some(Duration::from_secs(defaults::DB_IDLE_TIMEOUT_SECS)),
            acquire_timeout: Duration::from_secs(defaults::DB_ACQUIRE_TIMEOUT_SECS),
            timeouts: StoreTimeouts::default(),
        };
        if !config.is_memory() {
            return config;
        }
        Self {
            max_connections: 1,
            min_connections: 1,
            max_lifetime: None,
            idle_timeout: None,
            ..config
        }
    }

    /// Create SQLite configuration for a database file.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::from_url(format!("sqlite:{}", path.as_ref().display()))
    }

    /// In-memory SQLite configuration (for testing).
    pub fn sqlite_memory() -> Self {
        Self::from_url(MEMORY_URL)
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_timeouts(mut self, timeouts: StoreTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    /// Filesystem path of the database, `None` for in-memory databases.
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.is_memory() {
            return None;
        }
        let rest = self
            .url
            .strip_prefix("sqlite://")
            .or_else(|| self.url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().unwrap_or(rest).trim();
        if path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }
}

/// Create a database pool from configuration.
pub async fn create_pool(config: &DbConfig) -> Result<DbPool> {
    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true);

    if let Some(path) = config.database_path() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await?;

    info!(
        url = %config.url,
        max_connections = config.max_connections,
        "Connected to database"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_path_parsing() {
        assert_eq!(
            DbConfig::from_url("sqlite:archive.sqlite3").database_path(),
            Some(PathBuf::from("archive.sqlite3"))
        );
        assert_eq!(
            DbConfig::from_url("sqlite:///var/lib/archive.db?mode=rwc").database_path(),
            Some(PathBuf::from("/var/lib/archive.db"))
        );
        assert_eq!(DbConfig::sqlite_memory().database_path(), None);
        assert_eq!(DbConfig::from_url("postgres://x").database_path(), None);
    }

    #[test]
    fn test_memory_config_is_pinned() {
        let config = DbConfig::sqlite_memory();
        assert_eq!(config.max_connections, 1);
        assert!(config.max_lifetime.is_none());
        assert!(config.idle_timeout.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_pool() {
        let pool = create_pool(&DbConfig::sqlite_memory()).await;
        assert!(pool.is_ok());
    }
}
