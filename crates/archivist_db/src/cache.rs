//! Name-keyed prepared statement cache.
//!
//! Statements are prepared once against the pool and shared for the
//! lifetime of the process. SQLite re-prepares per connection behind the
//! scenes; the cache guarantees a single handle per name.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::sqlite::SqliteStatement;
use sqlx::{Executor, Statement};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

/// Shared handle to a cached statement.
pub type CachedStatement = Arc<SqliteStatement<'static>>;

/// A statement name paired with its SQL.
#[derive(Debug, Clone, Copy)]
pub struct NamedStatement {
    pub name: &'static str,
    pub sql: &'static str,
}

impl NamedStatement {
    pub const fn new(name: &'static str, sql: &'static str) -> Self {
        Self { name, sql }
    }
}

pub struct StatementCache {
    pool: DbPool,
    statements: Mutex<HashMap<String, CachedStatement>>,
}

impl StatementCache {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            statements: Mutex::new(HashMap::new()),
        }
    }

    /// Prepare `sql` under `name`, or return the handle already cached.
    ///
    /// Re-using a name for different SQL is rejected.
    pub async fn prepare(&self, name: &str, sql: &str) -> Result<CachedStatement> {
        let mut statements = self.statements.lock().await;
        if let Some(existing) = statements.get(name) {
            if existing.sql() != sql {
                return Err(DbError::invalid_state(format!(
                    "Statement {} already prepared with different SQL",
                    name
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let prepared = (&self.pool).prepare(sql).await?;
        let statement: CachedStatement = Arc::new(Statement::to_owned(&prepared));
        statements.insert(name.to_string(), Arc::clone(&statement));
        debug!(name, "Prepared statement");
        Ok(statement)
    }

    pub async fn get(&self, named: &NamedStatement) -> Result<CachedStatement> {
        self.prepare(named.name, named.sql).await
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.statements.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.statements.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every cached handle. Called at shutdown before the pool closes.
    pub async fn clear(&self) {
        let mut statements = self.statements.lock().await;
        let count = statements.len();
        statements.clear();
        debug!(count, "Statement cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    async fn cache() -> StatementCache {
        let pool = create_pool(&DbConfig::sqlite_memory()).await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        StatementCache::new(pool)
    }

    #[tokio::test]
    async fn test_prepare_same_name_returns_cached_handle() {
        let cache = cache().await;

        let first = cache.prepare("t.get", "SELECT v FROM t WHERE id = ?").await.unwrap();
        let second = cache.prepare("t.get", "SELECT v FROM t WHERE id = ?").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_prepare_rejects_conflicting_sql() {
        let cache = cache().await;

        cache.prepare("t.get", "SELECT v FROM t WHERE id = ?").await.unwrap();
        let err = cache
            .prepare("t.get", "SELECT id FROM t")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_prepare_invalid_sql_is_not_cached() {
        let cache = cache().await;

        assert!(cache.prepare("bad", "SELECT FROM nowhere").await.is_err());
        assert!(!cache.contains("bad").await);
    }

    #[tokio::test]
    async fn test_cached_statement_executes() {
        let cache = cache().await;
        let insert = cache
            .prepare("t.insert", "INSERT INTO t (id, v) VALUES (?, ?)")
            .await
            .unwrap();
        insert.query().bind(1_i64).bind("one").execute(&cache.pool).await.unwrap();

        let select = cache.prepare("t.get", "SELECT v FROM t WHERE id = ?").await.unwrap();
        let row = select.query().bind(1_i64).fetch_one(&cache.pool).await.unwrap();
        let value: String = sqlx::Row::get(&row, "v");
        assert_eq!(value, "one");

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
