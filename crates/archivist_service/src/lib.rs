//! Archivist service: LastFile ingestion, Atlas conversion, retention and
//! backups.
//!
//! ```text
//! broker --PUSH/PULL--> Listener --> LifecycleOrchestrator --> stores
//!                                         |
//!                                  ArchivalProcessor
//!
//! PeriodicTask(RetentionEngine)   PeriodicTask(BackupEngine)   PeriodicTask(AnalyticsJob)
//! ```
//!
//! Every component receives its database handle and metrics sink at
//! construction.

pub mod analytics;
pub mod backup;
pub mod config;
pub mod lifecycle;
pub mod listener;
pub mod metrics;
pub mod processor;
pub mod retention;
pub mod scheduler;

pub use analytics::AnalyticsJob;
pub use backup::{BackupEngine, BackupError, BackupInfo, BackupSettings};
pub use config::ServiceConfig;
pub use lifecycle::{IngestOutcome, LifecycleError, LifecycleOrchestrator};
pub use listener::{Listener, ListenerConfig, ListenerError, NotificationHandler};
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use processor::{classify, derive_tags, AlertSink, ArchivalProcessor, SuccessBucket};
pub use retention::{Candidate, DataType, RetentionEngine, RetentionPolicy, RetentionReport, RetentionTarget};
pub use scheduler::{PeriodicJob, PeriodicTask};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use archivist_db::{ArchiveDb, DbConfig};
use tracing::{info, warn};

/// Retention engine over the real stores, configured from `config`.
pub fn retention_engine(db: &ArchiveDb, config: &ServiceConfig, metrics: Arc<ServiceMetrics>) -> RetentionEngine {
    RetentionEngine::new(db.last_files(), db.atlas(), metrics)
        .with_batch_limit(config.retention.batch_limit)
        .with_policies(config.retention.policies.iter().cloned())
}

/// Backup engine for the configured database file.
pub fn backup_engine(db_config: &DbConfig, config: &ServiceConfig, metrics: Arc<ServiceMetrics>) -> BackupEngine {
    BackupEngine::new(
        BackupSettings::from(&config.backup),
        db_config.database_path(),
        metrics,
    )
}

/// A running service: listener plus background tasks.
pub struct Service {
    db: ArchiveDb,
    metrics: Arc<ServiceMetrics>,
    listener: Listener,
    tasks: Vec<PeriodicTask>,
}

impl Service {
    /// Open the database, connect to the broker and schedule background work.
    ///
    /// Any failure here is fatal to startup.
    pub async fn start(config: &ServiceConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(ServiceMetrics::new());
        let db_config = config.database.to_db_config();
        let db = ArchiveDb::open(db_config.clone())
            .await
            .context("Failed to open database")?;

        let orchestrator = Arc::new(
            LifecycleOrchestrator::new(db.clone(), Arc::clone(&metrics))
                .with_stale_after(config.lifecycle.stale_after()),
        );
        let mut listener = Listener::new(ListenerConfig::from(&config.broker), Arc::clone(&metrics));
        if let Err(e) = listener.start(orchestrator).await {
            db.close().await;
            return Err(e).context("Failed to start listener");
        }

        let mut tasks = Vec::new();
        if config.retention.enabled {
            let engine = Arc::new(retention_engine(&db, config, Arc::clone(&metrics)));
            tasks.push(PeriodicTask::spawn(
                "retention",
                Duration::from_secs(config.retention.interval_secs),
                engine,
            ));
        }
        if config.analytics.enabled {
            let job = Arc::new(AnalyticsJob::new(db.analytics(), Arc::clone(&metrics)));
            tasks.push(PeriodicTask::spawn(
                "analytics",
                Duration::from_secs(config.analytics.interval_secs),
                job,
            ));
        }
        if config.backup.enabled {
            if db_config.database_path().is_some() {
                let engine = Arc::new(backup_engine(&db_config, config, Arc::clone(&metrics)));
                tasks.push(PeriodicTask::spawn(
                    "backup",
                    Duration::from_secs(config.backup.interval_secs),
                    engine,
                ));
            } else {
                warn!("Backups disabled for in-memory database");
            }
        }

        info!(tasks = tasks.len(), "Archivist service started");
        Ok(Self {
            db,
            metrics,
            listener,
            tasks,
        })
    }

    pub fn db(&self) -> &ArchiveDb {
        &self.db
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Stop the listener, then background tasks, then close the pool.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let listener_result = self.listener.stop().await;
        for task in self.tasks.drain(..) {
            task.shutdown().await;
        }
        self.db.close().await;
        info!(metrics = %self.metrics.snapshot().summary(), "Archivist service stopped");
        listener_result.context("Failed to stop listener")
    }
}
