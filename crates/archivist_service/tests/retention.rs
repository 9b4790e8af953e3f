//! Retention passes over real stores and over scripted targets.

use std::sync::{Arc, Mutex};

use archivist_db::{ArchiveDb, Atlas, AtlasStatus, DbError, LastFile, LastFileStatus};
use archivist_service::{
    Candidate, DataType, RetentionEngine, RetentionPolicy, RetentionTarget, ServiceMetrics,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Map;

fn policy(data_type: DataType, retention_days: u32, archive_first: bool) -> RetentionPolicy {
    RetentionPolicy {
        data_type,
        retention_days,
        archive_first,
    }
}

fn last_file(id: &str, path: String, created_at: DateTime<Utc>) -> LastFile {
    let mut file = LastFile::received(id, path, 0.9, created_at, Map::new());
    file.created_at = created_at;
    file.updated_at = created_at;
    file
}

fn atlas(id: &str, last_file_id: &str, created_at: DateTime<Utc>) -> Atlas {
    Atlas {
        id: id.to_string(),
        last_file_id: last_file_id.to_string(),
        success_rate: 0.9,
        metadata: Map::new(),
        tags: vec!["success:high".to_string()],
        segment: None,
        status: AtlasStatus::Active,
        created_at,
        updated_at: created_at,
    }
}

#[tokio::test]
async fn test_expired_records_are_removed_and_recent_kept() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db = ArchiveDb::open_in_memory().await.unwrap();
    let now = Utc::now();

    let old_path = tmp.path().join("old.last");
    std::fs::write(&old_path, b"payload").unwrap();
    let missing_path = tmp.path().join("already-gone.last");
    let fresh_path = tmp.path().join("fresh.last");
    std::fs::write(&fresh_path, b"payload").unwrap();

    let last_files = db.last_files();
    last_files
        .create(&last_file("old", old_path.display().to_string(), now - Duration::days(31)))
        .await
        .unwrap();
    last_files
        .create(&last_file("gone", missing_path.display().to_string(), now - Duration::days(40)))
        .await
        .unwrap();
    last_files
        .create(&last_file("fresh", fresh_path.display().to_string(), now - Duration::days(29)))
        .await
        .unwrap();

    let atlas_store = db.atlas();
    atlas_store.create(&atlas("a-old", "old", now - Duration::days(91))).await.unwrap();
    last_files.update_atlas_id("old", "a-old").await.unwrap();
    atlas_store.create(&atlas("a-fresh", "fresh", now - Duration::days(89))).await.unwrap();

    let metrics = Arc::new(ServiceMetrics::new());
    let engine = RetentionEngine::new(db.last_files(), db.atlas(), Arc::clone(&metrics)).with_policies([
        policy(DataType::LastFiles, 30, true),
        policy(DataType::AtlasFiles, 90, true),
    ]);

    let reports = engine.apply_policies_at(now).await;
    assert_eq!(reports.len(), 2);

    let files_report = reports
        .iter()
        .find(|r| r.data_type == DataType::LastFiles)
        .unwrap();
    assert_eq!(files_report.selected, 2);
    assert_eq!(files_report.archived, 1);
    assert_eq!(files_report.deleted, 2);
    assert_eq!(files_report.files_removed, 1);
    assert_eq!(files_report.errors, 0);

    let atlas_report = reports
        .iter()
        .find(|r| r.data_type == DataType::AtlasFiles)
        .unwrap();
    assert_eq!(atlas_report.deleted, 1);

    assert!(last_files.get("old").await.unwrap().is_none());
    assert!(last_files.get("gone").await.unwrap().is_none());
    assert!(!old_path.exists());

    let fresh = last_files.get("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.status, LastFileStatus::Received);
    assert!(fresh_path.exists());

    assert!(atlas_store.get("a-old").await.unwrap().is_none());
    let kept = atlas_store.get("a-fresh").await.unwrap().unwrap();
    assert_eq!(kept.status, AtlasStatus::Active);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.retention_deleted, 3);
    assert_eq!(snapshot.retention_errors, 0);
}

#[tokio::test]
async fn test_failed_delete_leaves_unlinked_record_unarchived() {
    let db = ArchiveDb::open_in_memory().await.unwrap();
    let now = Utc::now();
    let last_files = db.last_files();
    last_files
        .create(&last_file("orphan", String::new(), now - Duration::days(45)))
        .await
        .unwrap();
    last_files.update_status("orphan", LastFileStatus::Failed).await.unwrap();

    sqlx::query(
        r#"CREATE TRIGGER block_delete BEFORE DELETE ON last_files
           BEGIN SELECT RAISE(ABORT, 'delete blocked'); END"#,
    )
    .execute(db.pool())
    .await
    .unwrap();

    let engine = RetentionEngine::new(db.last_files(), db.atlas(), Arc::new(ServiceMetrics::new()))
        .with_policies([policy(DataType::LastFiles, 30, true)]);
    let reports = engine.apply_policies_at(now).await;
    assert_eq!(reports[0].archived, 0);
    assert_eq!(reports[0].deleted, 0);
    assert_eq!(reports[0].errors, 1);

    let kept = last_files.get("orphan").await.unwrap().unwrap();
    assert_eq!(kept.status, LastFileStatus::Failed);
    assert!(kept.atlas_id.is_none());
}

#[tokio::test]
async fn test_empty_database_is_a_no_op() {
    let db = ArchiveDb::open_in_memory().await.unwrap();
    let engine = RetentionEngine::new(db.last_files(), db.atlas(), Arc::new(ServiceMetrics::new()))
        .with_policies([policy(DataType::LastFiles, 1, false)]);

    let reports = engine.apply_policies().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].selected, 0);
    assert_eq!(reports[0].deleted, 0);
}

/// Scripted target that records every call in order.
#[derive(Default)]
struct Scripted {
    candidates: Vec<Candidate>,
    fail_select: bool,
    fail_archive: Vec<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    fn with(ids: &[&str], calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            candidates: ids
                .iter()
                .map(|id| Candidate {
                    id: id.to_string(),
                    needs_archive: true,
                    file_path: None,
                })
                .collect(),
            calls,
            ..Default::default()
        }
    }
}

impl RetentionTarget for Scripted {
    async fn candidates(&self, _cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Candidate>, DbError> {
        if self.fail_select {
            return Err(DbError::Io(std::io::Error::other("select failed")));
        }
        Ok(self.candidates.iter().take(limit as usize).cloned().collect())
    }

    async fn archive(&self, id: &str) -> Result<(), DbError> {
        self.calls.lock().unwrap().push(format!("archive:{}", id));
        if self.fail_archive.iter().any(|f| f == id) {
            return Err(DbError::invalid_state("archive failed"));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DbError> {
        self.calls.lock().unwrap().push(format!("delete:{}", id));
        Ok(())
    }
}

#[tokio::test]
async fn test_archive_precedes_delete_and_failures_skip_record() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut files = Scripted::with(&["a", "b", "c"], Arc::clone(&calls));
    files.fail_archive = vec!["b".to_string()];
    let atlas = Scripted::with(&[], Arc::new(Mutex::new(Vec::new())));

    let engine = RetentionEngine::new(files, atlas, Arc::new(ServiceMetrics::new()))
        .with_policies([policy(DataType::LastFiles, 30, true)]);
    let reports = engine.apply_policies_at(Utc::now()).await;

    assert_eq!(
        *calls.lock().unwrap(),
        vec!["archive:a", "delete:a", "archive:b", "archive:c", "delete:c"]
    );
    assert_eq!(reports[0].archived, 2);
    assert_eq!(reports[0].deleted, 2);
    assert_eq!(reports[0].skipped, 1);
    assert_eq!(reports[0].errors, 1);
}

#[tokio::test]
async fn test_without_archive_first_only_deletes() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let files = Scripted::with(&["a", "b"], Arc::clone(&calls));
    let atlas = Scripted::default();

    let engine = RetentionEngine::new(files, atlas, Arc::new(ServiceMetrics::new()))
        .with_policies([policy(DataType::LastFiles, 30, false)]);
    engine.apply_policies_at(Utc::now()).await;

    assert_eq!(*calls.lock().unwrap(), vec!["delete:a", "delete:b"]);
}

#[tokio::test]
async fn test_selection_failure_does_not_stop_other_policies() {
    let file_calls = Arc::new(Mutex::new(Vec::new()));
    let atlas_calls = Arc::new(Mutex::new(Vec::new()));
    let mut files = Scripted::with(&["a"], Arc::clone(&file_calls));
    files.fail_select = true;
    let atlas = Scripted::with(&["x", "y"], Arc::clone(&atlas_calls));

    let metrics = Arc::new(ServiceMetrics::new());
    let engine = RetentionEngine::new(files, atlas, Arc::clone(&metrics))
        .with_batch_limit(1)
        .with_policies([
            policy(DataType::LastFiles, 30, true),
            policy(DataType::AtlasFiles, 90, false),
        ]);
    let reports = engine.apply_policies_at(Utc::now()).await;

    assert_eq!(reports.len(), 2);
    assert!(file_calls.lock().unwrap().is_empty());
    assert_eq!(*atlas_calls.lock().unwrap(), vec!["delete:x"]);
    assert_eq!(metrics.snapshot().retention_errors, 1);
    assert_eq!(metrics.snapshot().retention_deleted, 1);
}

#[tokio::test]
async fn test_later_policy_for_same_type_replaces_earlier() {
    let engine = RetentionEngine::new(Scripted::default(), Scripted::default(), Arc::new(ServiceMetrics::new()))
        .with_policies([
            policy(DataType::AtlasFiles, 90, true),
            policy(DataType::AtlasFiles, 10, false),
        ]);
    let policies: Vec<_> = engine.policies().collect();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].retention_days, 10);
}
