//! Atlas persistence.
//!
//! Tags are stored inline as a JSON array and searched with `json_each`.
//! `last_file_id` is unique: at most one Atlas exists per LastFile.

use chrono::{DateTime, Utc};
use sqlx::{Row, Statement};

use crate::cache::NamedStatement;
use crate::error::{DbError, Result};
use crate::pool::DbRow;
use crate::types::{Atlas, AtlasStatus, SegmentDetail, TagCount};
use crate::{metadata_from_json, millis_to_datetime, now_millis, timed, ArchiveDb};

const INSERT: NamedStatement = NamedStatement::new(
    "atlas.insert",
    r#"
    INSERT INTO atlas_files
        (id, last_file_id, success_rate, metadata, tags, segment, status, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
);

const GET: NamedStatement = NamedStatement::new(
    "atlas.get",
    "SELECT * FROM atlas_files WHERE id = ?",
);

const GET_BY_LAST_FILE: NamedStatement = NamedStatement::new(
    "atlas.get_by_last_file",
    "SELECT * FROM atlas_files WHERE last_file_id = ?",
);

const UPDATE_STATUS: NamedStatement = NamedStatement::new(
    "atlas.update_status",
    "UPDATE atlas_files SET status = ?, updated_at = ? WHERE id = ? AND status = 'active'",
);

const DELETE: NamedStatement = NamedStatement::new(
    "atlas.delete",
    "DELETE FROM atlas_files WHERE id = ?",
);

const SEARCH_BY_TAGS: NamedStatement = NamedStatement::new(
    "atlas.search_by_tags",
    r#"
    SELECT * FROM atlas_files
    WHERE EXISTS (
        SELECT 1 FROM json_each(atlas_files.tags) AS t
        WHERE t.value IN (SELECT value FROM json_each(?))
    )
    ORDER BY created_at DESC
    LIMIT ? OFFSET ?
    "#,
);

const LIST_BY_STATUS: NamedStatement = NamedStatement::new(
    "atlas.list_by_status",
    r#"
    SELECT * FROM atlas_files
    WHERE status = ?
    ORDER BY created_at DESC
    LIMIT ? OFFSET ?
    "#,
);

const DISTINCT_TAGS: NamedStatement = NamedStatement::new(
    "atlas.distinct_tags",
    r#"
    SELECT DISTINCT t.value AS tag
    FROM atlas_files, json_each(atlas_files.tags) AS t
    ORDER BY tag
    "#,
);

const TAG_COUNTS: NamedStatement = NamedStatement::new(
    "atlas.tag_counts",
    r#"
    SELECT t.value AS tag, COUNT(*) AS count
    FROM atlas_files, json_each(atlas_files.tags) AS t
    GROUP BY t.value
    ORDER BY count DESC, tag ASC
    LIMIT ?
    "#,
);

const OLDER_THAN: NamedStatement = NamedStatement::new(
    "atlas.older_than",
    r#"
    SELECT * FROM atlas_files
    WHERE created_at < ?
    ORDER BY created_at ASC
    LIMIT ?
    "#,
);

pub(crate) const STATEMENTS: &[NamedStatement] = &[
    INSERT,
    GET,
    GET_BY_LAST_FILE,
    UPDATE_STATUS,
    DELETE,
    SEARCH_BY_TAGS,
    LIST_BY_STATUS,
    DISTINCT_TAGS,
    TAG_COUNTS,
    OLDER_THAN,
];

/// Store for derived Atlas records.
#[derive(Clone)]
pub struct AtlasStore {
    db: ArchiveDb,
}

impl AtlasStore {
    pub(crate) fn new(db: ArchiveDb) -> Self {
        Self { db }
    }

    /// Insert a new record. A second Atlas for the same LastFile is a
    /// constraint violation.
    pub async fn create(&self, atlas: &Atlas) -> Result<()> {
        let metadata = serde_json::to_string(&atlas.metadata)?;
        let tags = serde_json::to_string(&atlas.tags)?;
        let segment = atlas
            .segment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        timed("atlas.create", self.db.timeouts().write, async {
            let stmt = self.db.statement(&INSERT).await?;
            stmt.query()
                .bind(&atlas.id)
                .bind(&atlas.last_file_id)
                .bind(atlas.success_rate)
                .bind(&metadata)
                .bind(&tags)
                .bind(&segment)
                .bind(atlas.status.as_str())
                .bind(atlas.created_at.timestamp_millis())
                .bind(atlas.updated_at.timestamp_millis())
                .execute(self.db.pool())
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Atlas>> {
        timed("atlas.get", self.db.timeouts().read, async {
            let stmt = self.db.statement(&GET).await?;
            let row = stmt.query().bind(id).fetch_optional(self.db.pool()).await?;
            row.as_ref().map(row_to_atlas).transpose()
        })
        .await
    }

    pub async fn get_by_last_file(&self, last_file_id: &str) -> Result<Option<Atlas>> {
        timed("atlas.get_by_last_file", self.db.timeouts().read, async {
            let stmt = self.db.statement(&GET_BY_LAST_FILE).await?;
            let row = stmt
                .query()
                .bind(last_file_id)
                .fetch_optional(self.db.pool())
                .await?;
            row.as_ref().map(row_to_atlas).transpose()
        })
        .await
    }

    /// Move an `active` record to `archived` or `deleted`.
    ///
    /// Returns `NotFound` for a missing id and `InvalidState` when the record
    /// is already terminal or the target is `active`.
    pub async fn update_status(&self, id: &str, status: AtlasStatus) -> Result<()> {
        if !AtlasStatus::Active.can_transition_to(status) {
            return Err(DbError::invalid_state(format!(
                "Atlas {} cannot move to {}",
                id, status
            )));
        }

        let rows_affected = timed("atlas.update_status", self.db.timeouts().write, async {
            let stmt = self.db.statement(&UPDATE_STATUS).await?;
            let result = stmt
                .query()
                .bind(status.as_str())
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows_affected > 0 {
            return Ok(());
        }
        match self.get(id).await? {
            None => Err(DbError::not_found(format!("Atlas {}", id))),
            Some(current) => Err(DbError::invalid_state(format!(
                "Atlas {} is {}, cannot move to {}",
                id, current.status, status
            ))),
        }
    }

    pub async fn archive(&self, id: &str) -> Result<()> {
        self.update_status(id, AtlasStatus::Archived).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        timed("atlas.delete", self.db.timeouts().write, async {
            let stmt = self.db.statement(&DELETE).await?;
            let result = stmt.query().bind(id).execute(self.db.pool()).await?;
            if result.rows_affected() == 0 {
                return Err(DbError::not_found(format!("Atlas {}", id)));
            }
            Ok(())
        })
        .await
    }

    /// Records carrying any of `tags`, newest first.
    pub async fn search_by_tags(&self, tags: &[String], limit: i64, offset: i64) -> Result<Vec<Atlas>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let wanted = serde_json::to_string(tags)?;

        timed("atlas.search_by_tags", self.db.timeouts().search, async {
            let stmt = self.db.statement(&SEARCH_BY_TAGS).await?;
            let rows = stmt
                .query()
                .bind(&wanted)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_atlas).collect()
        })
        .await
    }

    pub async fn list_by_status(&self, status: AtlasStatus, limit: i64, offset: i64) -> Result<Vec<Atlas>> {
        timed("atlas.list_by_status", self.db.timeouts().read, async {
            let stmt = self.db.statement(&LIST_BY_STATUS).await?;
            let rows = stmt
                .query()
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_atlas).collect()
        })
        .await
    }

    /// Every tag in use, sorted.
    pub async fn distinct_tags(&self) -> Result<Vec<String>> {
        timed("atlas.distinct_tags", self.db.timeouts().search, async {
            let stmt = self.db.statement(&DISTINCT_TAGS).await?;
            let rows = stmt.query().fetch_all(self.db.pool()).await?;
            rows.iter()
                .map(|row| row.try_get::<String, _>("tag").map_err(DbError::from))
                .collect()
        })
        .await
    }

    /// Most used tags first.
    pub async fn tag_counts(&self, limit: i64) -> Result<Vec<TagCount>> {
        timed("atlas.tag_counts", self.db.timeouts().search, async {
            let stmt = self.db.statement(&TAG_COUNTS).await?;
            let rows = stmt.query().bind(limit).fetch_all(self.db.pool()).await?;
            rows.iter()
                .map(|row| -> Result<TagCount> {
                    Ok(TagCount {
                        tag: row.try_get("tag")?,
                        count: row.try_get("count")?,
                    })
                })
                .collect()
        })
        .await
    }

    /// Records created before `cutoff`, oldest first, at most `limit`.
    pub async fn older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Atlas>> {
        timed("atlas.older_than", self.db.timeouts().search, async {
            let stmt = self.db.statement(&OLDER_THAN).await?;
            let rows = stmt
                .query()
                .bind(cutoff.timestamp_millis())
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_atlas).collect()
        })
        .await
    }
}

fn row_to_atlas(row: &DbRow) -> Result<Atlas> {
    let status: String = row.try_get("status")?;
    let status = AtlasStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("Unknown Atlas status: {}", status)))?;
    let metadata: String = row.try_get("metadata")?;
    let tags: String = row.try_get("tags")?;
    let segment: Option<String> = row.try_get("segment")?;
    let segment = segment
        .as_deref()
        .map(serde_json::from_str::<SegmentDetail>)
        .transpose()?;

    Ok(Atlas {
        id: row.try_get("id")?,
        last_file_id: row.try_get("last_file_id")?,
        success_rate: row.try_get("success_rate")?,
        metadata: metadata_from_json(&metadata)?,
        tags: serde_json::from_str(&tags)?,
        segment,
        status,
        created_at: millis_to_datetime(row.try_get("created_at")?),
        updated_at: millis_to_datetime(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn atlas(id: &str, last_file_id: &str, tags: &[&str]) -> Atlas {
        let now = Utc::now();
        Atlas {
            id: id.to_string(),
            last_file_id: last_file_id.to_string(),
            success_rate: 0.9,
            metadata: Metadata::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            segment: None,
            status: AtlasStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_get_and_lookup_by_last_file() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.atlas();

        let mut record = atlas("a1", "lf1", &["type:ocr", "success:high"]);
        record.segment = Some(SegmentDetail {
            version: 1,
            processing_time_ms: 250,
            token_count: 42,
            prompt_summary: None,
        });
        store.create(&record).await.unwrap();

        let loaded = store.get("a1").await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["type:ocr", "success:high"]);
        assert_eq!(loaded.segment.as_ref().map(|s| s.token_count), Some(42));

        let by_source = store.get_by_last_file("lf1").await.unwrap().unwrap();
        assert_eq!(by_source.id, "a1");
        assert!(store.get_by_last_file("lf2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_atlas_per_last_file() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.atlas();

        store.create(&atlas("a1", "lf1", &[])).await.unwrap();
        let err = store.create(&atlas("a2", "lf1", &[])).await.unwrap_err();
        assert!(err.is_constraint());
    }

    #[tokio::test]
    async fn test_status_is_forward_only() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.atlas();
        store.create(&atlas("a1", "lf1", &[])).await.unwrap();

        assert!(matches!(
            store.update_status("a1", AtlasStatus::Active).await,
            Err(DbError::InvalidState(_))
        ));

        store.archive("a1").await.unwrap();
        assert_eq!(
            store.get("a1").await.unwrap().unwrap().status,
            AtlasStatus::Archived
        );

        assert!(matches!(
            store.update_status("a1", AtlasStatus::Deleted).await,
            Err(DbError::InvalidState(_))
        ));
        assert!(store.archive("ghost").await.unwrap_err().is_not_found());
        assert!(store.delete("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tag_search_and_counts() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.atlas();

        store.create(&atlas("a1", "lf1", &["type:ocr", "success:high"])).await.unwrap();
        store.create(&atlas("a2", "lf2", &["success:low"])).await.unwrap();
        store.create(&atlas("a3", "lf3", &["type:ocr", "success:low"])).await.unwrap();

        let hits = store
            .search_by_tags(&["type:ocr".to_string()], 10, 0)
            .await
            .unwrap();
        let mut ids: Vec<_> = hits.iter().map(|a| a.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a1", "a3"]);

        let any = store
            .search_by_tags(&["success:high".to_string(), "success:low".to_string()], 10, 0)
            .await
            .unwrap();
        assert_eq!(any.len(), 3);
        assert!(store.search_by_tags(&[], 10, 0).await.unwrap().is_empty());

        assert_eq!(
            store.distinct_tags().await.unwrap(),
            vec!["success:high", "success:low", "type:ocr"]
        );

        let counts = store.tag_counts(2).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0], TagCount { tag: "success:low".into(), count: 2 });
        assert_eq!(counts[1], TagCount { tag: "type:ocr".into(), count: 2 });
    }
}
