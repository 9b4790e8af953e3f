//! LastFile persistence.

use chrono::{DateTime, Utc};
use sqlx::{Row, Statement};

use crate::cache::NamedStatement;
use crate::error::{DbError, Result};
use crate::pool::DbRow;
use crate::types::{LastFile, LastFileStatus, SuccessRateStats};
use crate::{metadata_from_json, millis_to_datetime, now_millis, timed, ArchiveDb};

const INSERT: NamedStatement = NamedStatement::new(
    "last_files.insert",
    r#"
    INSERT INTO last_files
        (id, file_path, success_rate, timestamp, metadata, atlas_id, status, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
);

const GET: NamedStatement = NamedStatement::new(
    "last_files.get",
    "SELECT * FROM last_files WHERE id = ?",
);

const UPDATE_STATUS: NamedStatement = NamedStatement::new(
    "last_files.update_status",
    "UPDATE last_files SET status = ?, updated_at = ? WHERE id = ?",
);

const CLAIM_FOR_PROCESSING: NamedStatement = NamedStatement::new(
    "last_files.claim_for_processing",
    r#"
    UPDATE last_files SET status = 'processing', updated_at = ?
    WHERE id = ?
      AND (status IN ('received', 'failed')
           OR (status = 'processing' AND updated_at < ?))
    "#,
);

const FAIL_PROCESSING: NamedStatement = NamedStatement::new(
    "last_files.fail_processing",
    "UPDATE last_files SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'processing'",
);

const UPDATE_ATLAS_ID: NamedStatement = NamedStatement::new(
    "last_files.update_atlas_id",
    "UPDATE last_files SET atlas_id = ?, updated_at = ? WHERE id = ?",
);

const LINK_ATLAS: NamedStatement = NamedStatement::new(
    "last_files.link_atlas",
    "UPDATE last_files SET atlas_id = ?, status = 'archived', updated_at = ? WHERE id = ?",
);

const LIST_BY_STATUS: NamedStatement = NamedStatement::new(
    "last_files.list_by_status",
    r#"
    SELECT * FROM last_files
    WHERE status = ?
    ORDER BY created_at DESC
    LIMIT ? OFFSET ?
    "#,
);

const LOW_SUCCESS_RATE: NamedStatement = NamedStatement::new(
    "last_files.low_success_rate",
    r#"
    SELECT * FROM last_files
    WHERE success_rate < ?
    ORDER BY success_rate ASC, created_at DESC
    LIMIT ?
    "#,
);

const SUCCESS_RATE_STATS: NamedStatement = NamedStatement::new(
    "last_files.success_rate_stats",
    r#"
    SELECT
        AVG(success_rate) AS average,
        MIN(success_rate) AS minimum,
        MAX(success_rate) AS maximum,
        COUNT(*) AS total
    FROM last_files
    "#,
);

const OLDER_THAN: NamedStatement = NamedStatement::new(
    "last_files.older_than",
    r#"
    SELECT * FROM last_files
    WHERE created_at < ?
    ORDER BY created_at ASC
    LIMIT ?
    "#,
);

const DELETE: NamedStatement = NamedStatement::new(
    "last_files.delete",
    "DELETE FROM last_files WHERE id = ?",
);

pub(crate) const STATEMENTS: &[NamedStatement] = &[
    INSERT,
    GET,
    UPDATE_STATUS,
    CLAIM_FOR_PROCESSING,
    FAIL_PROCESSING,
    UPDATE_ATLAS_ID,
    LINK_ATLAS,
    LIST_BY_STATUS,
    LOW_SUCCESS_RATE,
    SUCCESS_RATE_STATS,
    OLDER_THAN,
    DELETE,
];

/// Store for received result files.
#[derive(Clone)]
pub struct LastFileStore {
    db: ArchiveDb,
}

impl LastFileStore {
    pub(crate) fn new(db: ArchiveDb) -> Self {
        Self { db }
    }

    /// Insert a new record. A duplicate id is a constraint violation.
    pub async fn create(&self, file: &LastFile) -> Result<()> {
        let metadata = serde_json::to_string(&file.metadata)?;
        timed("last_files.create", self.db.timeouts().write, async {
            let stmt = self.db.statement(&INSERT).await?;
            stmt.query()
                .bind(&file.id)
                .bind(&file.file_path)
                .bind(file.success_rate)
                .bind(file.timestamp.timestamp_millis())
                .bind(&metadata)
                .bind(&file.atlas_id)
                .bind(file.status.as_str())
                .bind(file.created_at.timestamp_millis())
                .bind(file.updated_at.timestamp_millis())
                .execute(self.db.pool())
                .await?;
            Ok(())
        })
        .await
    }

    /// Fetch by id. A missing row is `Ok(None)`.
    pub async fn get(&self, id: &str) -> Result<Option<LastFile>> {
        timed("last_files.get", self.db.timeouts().read, async {
            let stmt = self.db.statement(&GET).await?;
            let row = stmt.query().bind(id).fetch_optional(self.db.pool()).await?;
            row.as_ref().map(row_to_last_file).transpose()
        })
        .await
    }

    pub async fn update_status(&self, id: &str, status: LastFileStatus) -> Result<()> {
        timed("last_files.update_status", self.db.timeouts().write, async {
            let stmt = self.db.statement(&UPDATE_STATUS).await?;
            let result = stmt
                .query()
                .bind(status.as_str())
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
            expect_row(result.rows_affected(), id)
        })
        .await
    }

    /// Move a `received` or `failed` record, or a `processing` one last
    /// touched before `stale_before`, to `processing`.
    ///
    /// Returns `false` when the record is in any other state, so exactly one
    /// of several concurrent callers wins the claim.
    pub async fn claim_for_processing(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        timed("last_files.claim_for_processing", self.db.timeouts().write, async {
            let stmt = self.db.statement(&CLAIM_FOR_PROCESSING).await?;
            let result = stmt
                .query()
                .bind(now_millis())
                .bind(id)
                .bind(stale_before.timestamp_millis())
                .execute(self.db.pool())
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// `processing` -> `failed`. Returns `false` if the record had already
    /// left `processing`, e.g. a concurrent run linked it.
    pub async fn fail_processing(&self, id: &str) -> Result<bool> {
        timed("last_files.fail_processing", self.db.timeouts().write, async {
            let stmt = self.db.statement(&FAIL_PROCESSING).await?;
            let result = stmt
                .query()
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn update_atlas_id(&self, id: &str, atlas_id: &str) -> Result<()> {
        timed("last_files.update_atlas_id", self.db.timeouts().write, async {
            let stmt = self.db.statement(&UPDATE_ATLAS_ID).await?;
            let result = stmt
                .query()
                .bind(atlas_id)
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
            expect_row(result.rows_affected(), id)
        })
        .await
    }

    /// Set the Atlas reference and mark the record `archived` in one statement.
    pub async fn link_atlas(&self, id: &str, atlas_id: &str) -> Result<()> {
        timed("last_files.link_atlas", self.db.timeouts().write, async {
            let stmt = self.db.statement(&LINK_ATLAS).await?;
            let result = stmt
                .query()
                .bind(atlas_id)
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
            expect_row(result.rows_affected(), id)
        })
        .await
    }

    /// Newest first.
    pub async fn list_by_status(
        &self,
        status: LastFileStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LastFile>> {
        timed("last_files.list_by_status", self.db.timeouts().read, async {
            let stmt = self.db.statement(&LIST_BY_STATUS).await?;
            let rows = stmt
                .query()
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_last_file).collect()
        })
        .await
    }

    /// Records strictly below `threshold`, worst first.
    pub async fn low_success_rate(&self, threshold: f64, limit: i64) -> Result<Vec<LastFile>> {
        timed("last_files.low_success_rate", self.db.timeouts().search, async {
            let stmt = self.db.statement(&LOW_SUCCESS_RATE).await?;
            let rows = stmt
                .query()
                .bind(threshold)
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_last_file).collect()
        })
        .await
    }

    /// Average, minimum and maximum success rate. All zero on an empty table.
    pub async fn success_rate_stats(&self) -> Result<SuccessRateStats> {
        timed("last_files.success_rate_stats", self.db.timeouts().search, async {
            let stmt = self.db.statement(&SUCCESS_RATE_STATS).await?;
            let row = stmt.query().fetch_one(self.db.pool()).await?;
            Ok(SuccessRateStats {
                average: row.try_get::<Option<f64>, _>("average")?.unwrap_or(0.0),
                minimum: row.try_get::<Option<f64>, _>("minimum")?.unwrap_or(0.0),
                maximum: row.try_get::<Option<f64>, _>("maximum")?.unwrap_or(0.0),
                total: row.try_get("total")?,
            })
        })
        .await
    }

    /// Records created before `cutoff`, oldest first, at most `limit`.
    pub async fn older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<LastFile>> {
        timed("last_files.older_than", self.db.timeouts().search, async {
            let stmt = self.db.statement(&OLDER_THAN).await?;
            let rows = stmt
                .query()
                .bind(cutoff.timestamp_millis())
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_last_file).collect()
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        timed("last_files.delete", self.db.timeouts().write, async {
            let stmt = self.db.statement(&DELETE).await?;
            let result = stmt.query().bind(id).execute(self.db.pool()).await?;
            expect_row(result.rows_affected(), id)
        })
        .await
    }
}

fn expect_row(rows_affected: u64, id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(DbError::not_found(format!("LastFile {}", id)));
    }
    Ok(())
}

fn row_to_last_file(row: &DbRow) -> Result<LastFile> {
    let status: String = row.try_get("status")?;
    let status = LastFileStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("Unknown LastFile status: {}", status)))?;
    let metadata: String = row.try_get("metadata")?;

    Ok(LastFile {
        id: row.try_get("id")?,
        file_path: row.try_get("file_path")?,
        success_rate: row.try_get("success_rate")?,
        timestamp: millis_to_datetime(row.try_get("timestamp")?),
        metadata: metadata_from_json(&metadata)?,
        atlas_id: row.try_get("atlas_id")?,
        status,
        created_at: millis_to_datetime(row.try_get("created_at")?),
        updated_at: millis_to_datetime(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use chrono::Duration;

    fn sample(id: &str, rate: f64) -> LastFile {
        LastFile::received(id, format!("/data/{}.last", id), rate, Utc::now(), Metadata::new())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();

        let mut file = sample("lf1", 0.95);
        file.metadata.insert("command_type".into(), "ocr".into());
        store.create(&file).await.unwrap();

        let loaded = store.get("lf1").await.unwrap().unwrap();
        assert_eq!(loaded.file_path, "/data/lf1.last");
        assert_eq!(loaded.status, LastFileStatus::Received);
        assert_eq!(loaded.metadata.get("command_type").and_then(|v| v.as_str()), Some("ocr"));
        assert!(loaded.atlas_id.is_none());

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_constraint() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();

        store.create(&sample("dup", 0.5)).await.unwrap();
        let err = store.create(&sample("dup", 0.5)).await.unwrap_err();
        assert!(err.is_constraint());
    }

    #[tokio::test]
    async fn test_updates_on_missing_row_are_not_found() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();

        let err = store
            .update_status("ghost", LastFileStatus::Processing)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.link_atlas("ghost", "a1").await.unwrap_err().is_not_found());
        assert!(store.update_atlas_id("ghost", "a1").await.unwrap_err().is_not_found());
        assert!(store.delete("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_link_atlas_sets_reference_and_status() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();

        store.create(&sample("lf1", 0.8)).await.unwrap();
        store.update_status("lf1", LastFileStatus::Processing).await.unwrap();
        store.link_atlas("lf1", "atlas-1").await.unwrap();

        let loaded = store.get("lf1").await.unwrap().unwrap();
        assert_eq!(loaded.status, LastFileStatus::Archived);
        assert_eq!(loaded.atlas_id.as_deref(), Some("atlas-1"));
    }

    #[tokio::test]
    async fn test_claim_only_from_claimable_states() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();
        let now = Utc::now();

        store.create(&sample("lf1", 0.8)).await.unwrap();
        assert!(store.claim_for_processing("lf1", now - Duration::minutes(10)).await.unwrap());
        assert!(!store.claim_for_processing("lf1", now - Duration::minutes(10)).await.unwrap());

        store.link_atlas("lf1", "atlas-1").await.unwrap();
        assert!(!store.claim_for_processing("lf1", now + Duration::minutes(1)).await.unwrap());
        assert!(!store.fail_processing("lf1").await.unwrap());

        let loaded = store.get("lf1").await.unwrap().unwrap();
        assert_eq!(loaded.status, LastFileStatus::Archived);
        assert_eq!(loaded.atlas_id.as_deref(), Some("atlas-1"));

        assert!(!store.claim_for_processing("ghost", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_processing_can_be_reclaimed() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();
        let now = Utc::now();

        let mut file = sample("stuck", 0.8);
        file.status = LastFileStatus::Processing;
        file.updated_at = now - Duration::hours(1);
        store.create(&file).await.unwrap();

        assert!(!store.claim_for_processing("stuck", now - Duration::hours(2)).await.unwrap());
        assert!(store.claim_for_processing("stuck", now - Duration::minutes(10)).await.unwrap());
        assert!(store.fail_processing("stuck").await.unwrap());
        assert_eq!(
            store.get("stuck").await.unwrap().unwrap().status,
            LastFileStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_queries_and_stats() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();

        let stats = store.success_rate_stats().await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average, 0.0);

        for (id, rate) in [("a", 0.2), ("b", 0.6), ("c", 1.0)] {
            store.create(&sample(id, rate)).await.unwrap();
        }
        store.update_status("c", LastFileStatus::Failed).await.unwrap();

        let low = store.low_success_rate(0.7, 10).await.unwrap();
        let ids: Vec<_> = low.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let received = store.list_by_status(LastFileStatus::Received, 10, 0).await.unwrap();
        assert_eq!(received.len(), 2);
        let failed = store.list_by_status(LastFileStatus::Failed, 10, 0).await.unwrap();
        assert_eq!(failed[0].id, "c");

        let stats = store.success_rate_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert!((stats.average - 0.6).abs() < 1e-9);
        assert_eq!(stats.minimum, 0.2);
        assert_eq!(stats.maximum, 1.0);
    }

    #[tokio::test]
    async fn test_older_than_respects_cutoff_and_limit() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.last_files();
        let now = Utc::now();

        for (id, age_days) in [("old1", 40), ("old2", 35), ("new", 1)] {
            let mut file = sample(id, 0.9);
            file.created_at = now - Duration::days(age_days);
            store.create(&file).await.unwrap();
        }

        let cutoff = now - Duration::days(30);
        let old = store.older_than(cutoff, 10).await.unwrap();
        let ids: Vec<_> = old.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["old1", "old2"]);

        assert_eq!(store.older_than(cutoff, 1).await.unwrap().len(), 1);
    }
}
