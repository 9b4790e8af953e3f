//! Connection manager and record stores for Archivist.
//!
//! [`ArchiveDb`] owns the pool, the prepared statement cache and the
//! per-operation deadlines. Stores borrow all three through cheap clones.
//!
//! ```rust,ignore
//! use archivist_db::{ArchiveDb, DbConfig, LastFileStatus};
//!
//! let db = ArchiveDb::open(DbConfig::sqlite("archive.sqlite3")).await?;
//! let received = db.last_files().list_by_status(LastFileStatus::Received, 50, 0).await?;
//! db.close().await;
//! ```

mod error;
mod types;

pub mod analytics;
pub mod atlas;
pub mod cache;
pub mod last_files;
pub mod migrate;
pub mod pool;
pub mod tags;

pub use analytics::AnalyticsStore;
pub use atlas::AtlasStore;
pub use cache::{CachedStatement, NamedStatement, StatementCache};
pub use error::{DbError, Result};
pub use last_files::LastFileStore;
pub use pool::{create_pool, DbConfig, DbPool, DbRow, StoreTimeouts};
pub use tags::TagStore;
pub use types::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

/// Database handle shared by every component of the service.
#[derive(Clone)]
pub struct ArchiveDb {
    pool: DbPool,
    statements: Arc<StatementCache>,
    timeouts: StoreTimeouts,
}

impl ArchiveDb {
    /// Connect, apply pending migrations and warm up the statement cache.
    pub async fn open(config: DbConfig) -> Result<Self> {
        let pool = create_pool(&config).await?;
        let applied = migrate::run_migrations(&pool).await?;
        if !applied.is_empty() {
            info!(versions = ?applied, "Database schema upgraded");
        }

        let db = Self::from_pool(pool, config.timeouts);
        db.warm_up().await?;
        info!(url = %config.url, "Database opened");
        Ok(db)
    }

    /// Migrated in-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(DbConfig::sqlite_memory()).await
    }

    /// Wrap an existing pool. Migrations are the caller's concern.
    pub fn from_pool(pool: DbPool, timeouts: StoreTimeouts) -> Self {
        let statements = Arc::new(StatementCache::new(pool.clone()));
        Self {
            pool,
            statements,
            timeouts,
        }
    }

    /// Prepare every statement the stores use.
    pub async fn warm_up(&self) -> Result<()> {
        let groups = [
            last_files::STATEMENTS,
            atlas::STATEMENTS,
            tags::STATEMENTS,
            analytics::STATEMENTS,
        ];
        for named in groups.iter().flat_map(|group| group.iter()) {
            self.statements.get(named).await?;
        }
        Ok(())
    }

    /// Get the underlying connection pool (escape hatch for ad-hoc queries).
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    pub fn timeouts(&self) -> StoreTimeouts {
        self.timeouts
    }

    pub fn last_files(&self) -> LastFileStore {
        LastFileStore::new(self.clone())
    }

    pub fn atlas(&self) -> AtlasStore {
        AtlasStore::new(self.clone())
    }

    pub fn tags(&self) -> TagStore {
        TagStore::new(self.clone())
    }

    pub fn analytics(&self) -> AnalyticsStore {
        AnalyticsStore::new(self.clone())
    }

    /// Drop cached statements, then close the pool.
    pub async fn close(&self) {
        self.statements.clear().await;
        self.pool.close().await;
        info!("Database closed");
    }

    pub(crate) async fn statement(&self, named: &NamedStatement) -> Result<CachedStatement> {
        self.statements.get(named).await
    }
}

/// Run `fut` under `limit`, failing closed with [`DbError::Timeout`].
pub(crate) async fn timed<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout { operation, limit }),
    }
}

/// Current time as milliseconds since Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert milliseconds to DateTime.
pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
}

pub(crate) fn metadata_from_json(raw: &str) -> Result<Metadata> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("archive.sqlite3");

        let db = ArchiveDb::open(DbConfig::sqlite(&db_path)).await.unwrap();
        assert!(db_path.exists());
        assert!(!db.statements().is_empty().await);

        db.close().await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_version() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("archive.sqlite3");

        let db = ArchiveDb::open(DbConfig::sqlite(&db_path)).await.unwrap();
        db.close().await;

        let db = ArchiveDb::open(DbConfig::sqlite(&db_path)).await.unwrap();
        assert_eq!(
            migrate::current_version(db.pool()).await.unwrap(),
            Some(migrate::latest_version())
        );
        db.close().await;
    }

    #[tokio::test]
    async fn test_timed_fails_closed() {
        let result: Result<()> = timed("sleepy", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(DbError::Timeout { operation, .. }) => assert_eq!(operation, "sleepy"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_millis_round_trip() {
        let millis = 1_700_000_000_123;
        assert_eq!(millis_to_datetime(millis).timestamp_millis(), millis);
    }
}
