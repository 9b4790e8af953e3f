//! Ingestion-to-archival lifecycle.
//!
//! ```text
//! persist(received) -> processing -> evaluate -> create Atlas -> link(archived)
//!                          |                          |              |
//!                   stays received              -> failed        -> failed
//! ```
//!
//! Re-delivery of a known id goes through a conditional claim: `received`
//! and `failed` records are re-driven, as is a `processing` record nobody
//! has touched for `stale_after`. Everything else is left alone. An Atlas
//! left behind by a failed link is picked up again instead of creating a
//! second one.

use std::sync::Arc;

use archivist_db::{Atlas, AtlasStatus, DbError, LastFile, LastFileStatus, ArchiveDb};
use archivist_protocol::defaults::PROCESSING_STALE_SECS;
use archivist_protocol::Notification;
use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::listener::NotificationHandler;
use crate::metrics::ServiceMetrics;
use crate::processor::{AlertSink, ArchivalProcessor, TracingAlertSink};

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Step 1: nothing was stored.
    #[error("Failed to persist LastFile {id}: {source}")]
    Persist { id: String, source: DbError },

    /// Step 2: the record keeps its previous status.
    #[error("Failed to mark LastFile {id} processing: {source}")]
    Transition { id: String, source: DbError },

    /// Step 5: the record is `failed` and has no Atlas reference.
    #[error("Failed to convert LastFile {id} to Atlas: {source}")]
    Conversion { id: String, source: DbError },

    /// Step 6: the record is `failed`; Atlas {atlas_id} remains as an orphan.
    #[error("Failed to link LastFile {id} to Atlas {atlas_id}: {source}")]
    Link {
        id: String,
        atlas_id: String,
        source: DbError,
    },
}

impl LifecycleError {
    pub fn last_file_id(&self) -> &str {
        match self {
            Self::Persist { id, .. }
            | Self::Transition { id, .. }
            | Self::Conversion { id, .. }
            | Self::Link { id, .. } => id,
        }
    }
}

/// Result of one ingestion run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Converted and linked by this run.
    Archived { atlas_id: String },
    /// Already converted earlier; nothing was done.
    AlreadyArchived { atlas_id: Option<String> },
    /// Another delivery of the same id is being processed.
    InFlight,
}

pub struct LifecycleOrchestrator {
    db: ArchiveDb,
    processor: ArchivalProcessor,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<ServiceMetrics>,
    stale_after: Duration,
}

impl LifecycleOrchestrator {
    pub fn new(db: ArchiveDb, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            db,
            processor: ArchivalProcessor::new(),
            alerts: Arc::new(TracingAlertSink),
            metrics,
            stale_after: Duration::seconds(PROCESSING_STALE_SECS as i64),
        }
    }

    /// How long a `processing` record may go untouched before a
    /// redelivery takes it over.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Run the full pipeline for one notification.
    pub async fn ingest(&self, notification: &Notification) -> Result<IngestOutcome, LifecycleError> {
        let id = notification.id.as_str();
        let last_files = self.db.last_files();

        let existing = last_files
            .get(id)
            .await
            .map_err(|source| LifecycleError::Persist {
                id: id.to_string(),
                source,
            })?;

        match existing {
            None => {
                let record = LastFile::received(
                    id,
                    notification.file_path.as_str(),
                    notification.success_rate,
                    notification.timestamp,
                    notification.metadata.clone(),
                );
                match last_files.create(&record).await {
                    Ok(()) => self.metrics.inc_ingested(),
                    Err(e) if e.is_constraint() => {
                        // A concurrent delivery persisted it first.
                        debug!(id, "LastFile persisted by a concurrent delivery");
                        self.metrics.inc_skipped_duplicates();
                        return Ok(IngestOutcome::InFlight);
                    }
                    Err(source) => {
                        return Err(LifecycleError::Persist {
                            id: id.to_string(),
                            source,
                        })
                    }
                }
            }
            Some(existing) => match existing.status {
                LastFileStatus::Archived => {
                    info!(id, "LastFile already archived, skipping");
                    self.metrics.inc_skipped_duplicates();
                    return Ok(IngestOutcome::AlreadyArchived {
                        atlas_id: existing.atlas_id,
                    });
                }
                LastFileStatus::Processing => {
                    info!(id, since = %existing.updated_at, "LastFile in processing, claiming if stale");
                }
                LastFileStatus::Received | LastFileStatus::Failed => {
                    info!(id, status = %existing.status, "Re-driving LastFile");
                }
            },
        }

        let stale_before = Utc::now() - self.stale_after;
        let claimed = last_files
            .claim_for_processing(id, stale_before)
            .await
            .map_err(|source| LifecycleError::Transition {
                id: id.to_string(),
                source,
            })?;
        if !claimed {
            return Ok(self.not_claimed(id).await);
        }

        let evaluation = self.processor.evaluate(notification);
        if evaluation.low_success {
            self.alerts
                .low_success_rate(notification, self.processor.alert_threshold());
            self.metrics.inc_low_success_alerts();
        }

        let atlas_id = match self.convert(notification, evaluation.tags).await {
            Ok(atlas_id) => atlas_id,
            Err(source) => {
                self.mark_failed(id).await;
                return Err(LifecycleError::Conversion {
                    id: id.to_string(),
                    source,
                });
            }
        };

        if let Err(source) = last_files.link_atlas(id, &atlas_id).await {
            self.mark_failed(id).await;
            return Err(LifecycleError::Link {
                id: id.to_string(),
                atlas_id,
                source,
            });
        }

        self.metrics.inc_archived();
        info!(id, atlas_id = %atlas_id, bucket = %evaluation.bucket, "LastFile archived");
        Ok(IngestOutcome::Archived { atlas_id })
    }

    /// Create the Atlas for `notification`, or reuse the one a previous run
    /// created before failing to link it.
    async fn convert(&self, notification: &Notification, tags: Vec<String>) -> Result<String, DbError> {
        let atlas_store = self.db.atlas();
        if let Some(orphan) = atlas_store.get_by_last_file(&notification.id).await? {
            info!(id = %notification.id, atlas_id = %orphan.id, "Reusing existing Atlas");
            return Ok(orphan.id);
        }

        let now = Utc::now();
        let atlas = Atlas {
            id: uuid::Uuid::new_v4().to_string(),
            last_file_id: notification.id.clone(),
            success_rate: notification.success_rate,
            metadata: notification.metadata.clone(),
            tags,
            segment: None,
            status: AtlasStatus::Active,
            created_at: now,
            updated_at: now,
        };
        match atlas_store.create(&atlas).await {
            Ok(()) => {
                debug!(id = %notification.id, atlas_id = %atlas.id, tags = ?atlas.tags, "Atlas created");
                Ok(atlas.id)
            }
            Err(e) if e.is_constraint() => {
                // Lost the race against a concurrent delivery of the same id.
                match atlas_store.get_by_last_file(&notification.id).await? {
                    Some(winner) => Ok(winner.id),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Outcome for a delivery that lost the claim on `id`.
    async fn not_claimed(&self, id: &str) -> IngestOutcome {
        self.metrics.inc_skipped_duplicates();
        match self.db.last_files().get(id).await {
            Ok(Some(current)) if current.status == LastFileStatus::Archived => {
                info!(id, "LastFile already archived, skipping");
                IngestOutcome::AlreadyArchived {
                    atlas_id: current.atlas_id,
                }
            }
            Ok(_) => {
                info!(id, "LastFile claimed by another delivery, skipping");
                IngestOutcome::InFlight
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to re-read unclaimed LastFile");
                IngestOutcome::InFlight
            }
        }
    }

    /// Record a failed run. Only a record still `processing` moves to
    /// `failed`; one a concurrent run already linked is left alone. If the
    /// write itself fails the record stays `processing` until it goes stale.
    async fn mark_failed(&self, id: &str) {
        self.metrics.inc_failed();
        match self.db.last_files().fail_processing(id).await {
            Ok(true) => {}
            Ok(false) => debug!(id, "LastFile left processing before it could be marked failed"),
            Err(e) => error!(id, error = %e, "Failed to mark LastFile failed"),
        }
    }
}

impl NotificationHandler for LifecycleOrchestrator {
    async fn handle(&self, notification: Notification) {
        match self.ingest(&notification).await {
            Ok(outcome) => debug!(id = %notification.id, ?outcome, "Notification handled"),
            Err(e) => warn!(id = %e.last_file_id(), error = %e, "Ingestion failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(id: &str, rate: f64) -> Notification {
        Notification {
            id: id.to_string(),
            file_path: format!("{}.last", id),
            success_rate: rate,
            timestamp: Utc::now(),
            metadata: json!({"command_type": "ocr"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }
    }

    async fn orchestrator() -> (LifecycleOrchestrator, ArchiveDb, Arc<ServiceMetrics>) {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let metrics = Arc::new(ServiceMetrics::new());
        (
            LifecycleOrchestrator::new(db.clone(), Arc::clone(&metrics)),
            db,
            metrics,
        )
    }

    #[tokio::test]
    async fn test_ingest_links_both_records() {
        let (orchestrator, db, metrics) = orchestrator().await;

        let outcome = orchestrator.ingest(&notification("lf1", 0.95)).await.unwrap();
        let IngestOutcome::Archived { atlas_id } = outcome else {
            panic!("expected archived outcome");
        };

        let last_file = db.last_files().get("lf1").await.unwrap().unwrap();
        assert_eq!(last_file.status, LastFileStatus::Archived);
        assert_eq!(last_file.atlas_id.as_deref(), Some(atlas_id.as_str()));

        let atlas = db.atlas().get(&atlas_id).await.unwrap().unwrap();
        assert_eq!(atlas.last_file_id, "lf1");
        assert_eq!(atlas.tags, vec!["type:ocr", "success:high"]);
        assert_eq!(metrics.snapshot().archived, 1);
    }

    #[tokio::test]
    async fn test_reingesting_archived_is_noop() {
        let (orchestrator, db, metrics) = orchestrator().await;
        let n = notification("lf1", 0.8);

        let IngestOutcome::Archived { atlas_id } = orchestrator.ingest(&n).await.unwrap() else {
            panic!("expected archived outcome");
        };
        let again = orchestrator.ingest(&n).await.unwrap();
        assert_eq!(
            again,
            IngestOutcome::AlreadyArchived {
                atlas_id: Some(atlas_id)
            }
        );
        assert_eq!(db.atlas().tag_counts(10).await.unwrap()[0].count, 1);
        assert_eq!(metrics.snapshot().skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn test_processing_record_is_in_flight() {
        let (orchestrator, db, _) = orchestrator().await;
        let n = notification("lf1", 0.8);
        let record = LastFile::received("lf1", "lf1.last", 0.8, Utc::now(), Default::default());
        db.last_files().create(&record).await.unwrap();
        db.last_files()
            .update_status("lf1", LastFileStatus::Processing)
            .await
            .unwrap();

        assert_eq!(orchestrator.ingest(&n).await.unwrap(), IngestOutcome::InFlight);
        assert!(db.atlas().get_by_last_file("lf1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_processing_record_is_reclaimed() {
        let (orchestrator, db, _) = orchestrator().await;
        let mut record = LastFile::received("lf1", "lf1.last", 0.8, Utc::now(), Default::default());
        record.status = LastFileStatus::Processing;
        record.updated_at = Utc::now() - Duration::hours(2);
        db.last_files().create(&record).await.unwrap();

        let outcome = orchestrator.ingest(&notification("lf1", 0.8)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Archived { .. }));
        let last_file = db.last_files().get("lf1").await.unwrap().unwrap();
        assert_eq!(last_file.status, LastFileStatus::Archived);
    }

    #[tokio::test]
    async fn test_received_record_is_redriven() {
        let (orchestrator, db, metrics) = orchestrator().await;
        let record = LastFile::received("lf1", "lf1.last", 0.8, Utc::now(), Default::default());
        db.last_files().create(&record).await.unwrap();

        let outcome = orchestrator.ingest(&notification("lf1", 0.8)).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Archived { .. }));
        assert_eq!(metrics.snapshot().ingested, 0);
    }
}
