//! In-memory service counters.
//!
//! Lock-free atomics, one instance per process, handed to each component as
//! an `Arc<ServiceMetrics>`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    // Listener
    pub messages_received: AtomicU64,
    pub decode_errors: AtomicU64,

    // Lifecycle
    pub ingested: AtomicU64,
    pub archived: AtomicU64,
    pub failed: AtomicU64,
    pub skipped_duplicates: AtomicU64,
    pub low_success_alerts: AtomicU64,

    // Retention
    pub retention_archived: AtomicU64,
    pub retention_deleted: AtomicU64,
    pub retention_errors: AtomicU64,

    // Backup
    pub backups_created: AtomicU64,
    pub backups_failed: AtomicU64,
    pub backups_pruned: AtomicU64,

    // Analytics
    pub analytics_days_refreshed: AtomicU64,
    pub analytics_errors: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $add:ident, $field:ident) => {
        #[inline]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_messages_received, add_messages_received, messages_received);
    counter!(inc_decode_errors, add_decode_errors, decode_errors);
    counter!(inc_ingested, add_ingested, ingested);
    counter!(inc_archived, add_archived, archived);
    counter!(inc_failed, add_failed, failed);
    counter!(inc_skipped_duplicates, add_skipped_duplicates, skipped_duplicates);
    counter!(inc_low_success_alerts, add_low_success_alerts, low_success_alerts);
    counter!(inc_retention_archived, add_retention_archived, retention_archived);
    counter!(inc_retention_deleted, add_retention_deleted, retention_deleted);
    counter!(inc_retention_errors, add_retention_errors, retention_errors);
    counter!(inc_backups_created, add_backups_created, backups_created);
    counter!(inc_backups_failed, add_backups_failed, backups_failed);
    counter!(inc_backups_pruned, add_backups_pruned, backups_pruned);
    counter!(inc_analytics_days_refreshed, add_analytics_days_refreshed, analytics_days_refreshed);
    counter!(inc_analytics_errors, add_analytics_errors, analytics_errors);

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_duplicates: self.skipped_duplicates.load(Ordering::Relaxed),
            low_success_alerts: self.low_success_alerts.load(Ordering::Relaxed),
            retention_archived: self.retention_archived.load(Ordering::Relaxed),
            retention_deleted: self.retention_deleted.load(Ordering::Relaxed),
            retention_errors: self.retention_errors.load(Ordering::Relaxed),
            backups_created: self.backups_created.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            backups_pruned: self.backups_pruned.load(Ordering::Relaxed),
            analytics_days_refreshed: self.analytics_days_refreshed.load(Ordering::Relaxed),
            analytics_errors: self.analytics_errors.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub decode_errors: u64,
    pub ingested: u64,
    pub archived: u64,
    pub failed: u64,
    pub skipped_duplicates: u64,
    pub low_success_alerts: u64,
    pub retention_archived: u64,
    pub retention_deleted: u64,
    pub retention_errors: u64,
    pub backups_created: u64,
    pub backups_failed: u64,
    pub backups_pruned: u64,
    pub analytics_days_refreshed: u64,
    pub analytics_errors: u64,
}

impl MetricsSnapshot {
    /// Share of finished conversions that ended `archived`.
    pub fn conversion_ratio(&self) -> f64 {
        let finished = self.archived + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.archived as f64 / finished as f64
        }
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Messages: {} received, {} undecodable | \
             LastFiles: {} ingested, {} archived, {} failed, {} duplicates, {} low-rate alerts | \
             Retention: {} archived, {} deleted, {} errors | \
             Backups: {} created, {} failed, {} pruned | \
             Analytics: {} days refreshed, {} errors",
            self.messages_received,
            self.decode_errors,
            self.ingested,
            self.archived,
            self.failed,
            self.skipped_duplicates,
            self.low_success_alerts,
            self.retention_archived,
            self.retention_deleted,
            self.retention_errors,
            self.backups_created,
            self.backups_failed,
            self.backups_pruned,
            self.analytics_days_refreshed,
            self.analytics_errors,
        )
    }
}
