//! Tag catalog used for faceted listing.

use sqlx::{Row, Statement};

use crate::cache::NamedStatement;
use crate::error::{DbError, Result};
use crate::pool::DbRow;
use crate::types::Tag;
use crate::{millis_to_datetime, now_millis, timed, ArchiveDb};

const INSERT: NamedStatement = NamedStatement::new(
    "tags.insert",
    "INSERT INTO tags (id, name, category, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
);

const GET: NamedStatement = NamedStatement::new("tags.get", "SELECT * FROM tags WHERE id = ?");

const GET_BY_NAME: NamedStatement =
    NamedStatement::new("tags.get_by_name", "SELECT * FROM tags WHERE name = ?");

const UPDATE: NamedStatement = NamedStatement::new(
    "tags.update",
    "UPDATE tags SET name = ?, category = ?, updated_at = ? WHERE id = ?",
);

const LIST: NamedStatement = NamedStatement::new(
    "tags.list",
    "SELECT * FROM tags ORDER BY category, name LIMIT ? OFFSET ?",
);

const COUNT: NamedStatement = NamedStatement::new("tags.count", "SELECT COUNT(*) AS total FROM tags");

const LIST_BY_CATEGORY: NamedStatement = NamedStatement::new(
    "tags.list_by_category",
    "SELECT * FROM tags WHERE category = ? ORDER BY name",
);

const DELETE: NamedStatement = NamedStatement::new("tags.delete", "DELETE FROM tags WHERE id = ?");

pub(crate) const STATEMENTS: &[NamedStatement] = &[
    INSERT,
    GET,
    GET_BY_NAME,
    UPDATE,
    LIST,
    COUNT,
    LIST_BY_CATEGORY,
    DELETE,
];

#[derive(Clone)]
pub struct TagStore {
    db: ArchiveDb,
}

impl TagStore {
    pub(crate) fn new(db: ArchiveDb) -> Self {
        Self { db }
    }

    /// Insert a catalog entry. Names are unique.
    pub async fn create(&self, tag: &Tag) -> Result<()> {
        timed("tags.create", self.db.timeouts().write, async {
            let stmt = self.db.statement(&INSERT).await?;
            stmt.query()
                .bind(&tag.id)
                .bind(&tag.name)
                .bind(&tag.category)
                .bind(tag.created_at.timestamp_millis())
                .bind(tag.updated_at.timestamp_millis())
                .execute(self.db.pool())
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Tag>> {
        timed("tags.get", self.db.timeouts().read, async {
            let stmt = self.db.statement(&GET).await?;
            let row = stmt.query().bind(id).fetch_optional(self.db.pool()).await?;
            row.as_ref().map(row_to_tag).transpose()
        })
        .await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Tag>> {
        timed("tags.get_by_name", self.db.timeouts().read, async {
            let stmt = self.db.statement(&GET_BY_NAME).await?;
            let row = stmt.query().bind(name).fetch_optional(self.db.pool()).await?;
            row.as_ref().map(row_to_tag).transpose()
        })
        .await
    }

    pub async fn update(&self, id: &str, name: &str, category: &str) -> Result<()> {
        timed("tags.update", self.db.timeouts().write, async {
            let stmt = self.db.statement(&UPDATE).await?;
            let result = stmt
                .query()
                .bind(name)
                .bind(category)
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
            if result.rows_affected() == 0 {
                return Err(DbError::not_found(format!("Tag {}", id)));
            }
            Ok(())
        })
        .await
    }

    /// One page of tags plus the total count.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Tag>, i64)> {
        timed("tags.list", self.db.timeouts().read, async {
            let list = self.db.statement(&LIST).await?;
            let rows = list
                .query()
                .bind(limit)
                .bind(offset)
                .fetch_all(self.db.pool())
                .await?;
            let tags = rows.iter().map(row_to_tag).collect::<Result<Vec<_>>>()?;

            let count = self.db.statement(&COUNT).await?;
            let total: i64 = count.query().fetch_one(self.db.pool()).await?.try_get("total")?;
            Ok((tags, total))
        })
        .await
    }

    pub async fn list_by_category(&self, category: &str) -> Result<Vec<Tag>> {
        timed("tags.list_by_category", self.db.timeouts().read, async {
            let stmt = self.db.statement(&LIST_BY_CATEGORY).await?;
            let rows = stmt.query().bind(category).fetch_all(self.db.pool()).await?;
            rows.iter().map(row_to_tag).collect()
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        timed("tags.delete", self.db.timeouts().write, async {
            let stmt = self.db.statement(&DELETE).await?;
            let result = stmt.query().bind(id).execute(self.db.pool()).await?;
            if result.rows_affected() == 0 {
                return Err(DbError::not_found(format!("Tag {}", id)));
            }
            Ok(())
        })
        .await
    }
}

fn row_to_tag(row: &DbRow) -> Result<Tag> {
    Ok(Tag {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
        updated_at: millis_to_datetime(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tag(id: &str, name: &str, category: &str) -> Tag {
        let now = Utc::now();
        Tag {
            id: id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_tag_crud() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.tags();

        store.create(&tag("t1", "ocr", "type")).await.unwrap();
        store.create(&tag("t2", "high", "success")).await.unwrap();
        store.create(&tag("t3", "low", "success")).await.unwrap();

        assert_eq!(store.get_by_name("ocr").await.unwrap().unwrap().id, "t1");
        assert!(store.get("nope").await.unwrap().is_none());

        let (page, total) = store.list(2, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "high");

        let success: Vec<_> = store
            .list_by_category("success")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(success, vec!["high", "low"]);

        store.update("t1", "ocr-v2", "type").await.unwrap();
        assert_eq!(store.get("t1").await.unwrap().unwrap().name, "ocr-v2");

        store.delete("t3").await.unwrap();
        assert!(store.delete("t3").await.unwrap_err().is_not_found());
        assert!(store.update("t3", "x", "y").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tag_names_are_unique() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let store = db.tags();

        store.create(&tag("t1", "ocr", "type")).await.unwrap();
        let err = store.create(&tag("t2", "ocr", "other")).await.unwrap_err();
        assert!(err.is_constraint());
    }
}
