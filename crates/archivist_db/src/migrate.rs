//! Versioned schema migrations.
//!
//! Migrations are applied in order, each in its own transaction, and
//! recorded in `schema_migrations`. Applied versions are never re-run, so a
//! script must not be edited once released; add a new version instead.

use tracing::info;

use crate::error::{DbError, Result};
use crate::pool::DbPool;

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "last_files, atlas_files, tags",
        sql: r#"
            CREATE TABLE IF NOT EXISTS last_files (
                id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                success_rate REAL NOT NULL CHECK (success_rate >= 0.0 AND success_rate <= 1.0),
                timestamp INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                atlas_id TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_last_files_status ON last_files(status);
            CREATE INDEX IF NOT EXISTS idx_last_files_created_at ON last_files(created_at);
            CREATE INDEX IF NOT EXISTS idx_last_files_success_rate ON last_files(success_rate);

            CREATE TABLE IF NOT EXISTS atlas_files (
                id TEXT PRIMARY KEY,
                last_file_id TEXT NOT NULL,
                success_rate REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                tags TEXT NOT NULL DEFAULT '[]',
                segment TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_atlas_files_last_file_id ON atlas_files(last_file_id);
            CREATE INDEX IF NOT EXISTS idx_atlas_files_status ON atlas_files(status);
            CREATE INDEX IF NOT EXISTS idx_atlas_files_created_at ON atlas_files(created_at);

            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                category TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tags_category ON tags(category);
        "#,
    },
    Migration {
        version: 2,
        description: "analytics_daily",
        sql: r#"
            CREATE TABLE IF NOT EXISTS analytics_daily (
                period TEXT PRIMARY KEY,
                last_files_total INTEGER NOT NULL,
                last_files_archived INTEGER NOT NULL,
                last_files_failed INTEGER NOT NULL,
                atlas_created INTEGER NOT NULL,
                average_success_rate REAL NOT NULL,
                computed_at INTEGER NOT NULL
            );
        "#,
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply every pending migration. Returns the versions applied by this call.
pub async fn run_migrations(pool: &DbPool) -> Result<Vec<i64>> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;

    let mut newly_applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| !applied.contains(&m.version)) {
        let mut tx = pool.begin().await?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration {
                version: migration.version,
                message: e.to_string(),
            })?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.description)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            version = migration.version,
            description = migration.description,
            "Applied schema migration"
        );
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}

/// Highest applied version, `None` on a database never migrated.
pub async fn current_version(pool: &DbPool) -> Result<Option<i64>> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
    )
    .fetch_optional(pool)
    .await?;
    if exists.is_none() {
        return Ok(None);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn test_migrations_apply_once() {
        let pool = create_pool(&DbConfig::sqlite_memory()).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), None);

        let first = run_migrations(&pool).await.unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(current_version(&pool).await.unwrap(), Some(latest_version()));

        let second = run_migrations(&pool).await.unwrap();
        assert!(second.is_empty());
    }
}
