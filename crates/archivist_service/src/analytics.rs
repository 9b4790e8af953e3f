//! Daily analytics refresh.
//!
//! Each pass recomputes yesterday and today, so the previous day's row gets
//! its final counts on the first pass after UTC midnight.

use std::sync::Arc;

use archivist_db::{AnalyticsDay, AnalyticsStore, DbError};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::metrics::ServiceMetrics;
use crate::scheduler::PeriodicJob;

pub struct AnalyticsJob {
    store: AnalyticsStore,
    metrics: Arc<ServiceMetrics>,
}

impl AnalyticsJob {
    pub fn new(store: AnalyticsStore, metrics: Arc<ServiceMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Recompute and store the rows for the day before `now` and the day of `now`.
    ///
    /// A failing day does not stop the other one; the first error is returned
    /// after both were attempted.
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Vec<AnalyticsDay>, DbError> {
        let today = now.date_naive();
        let mut refreshed = Vec::with_capacity(2);
        let mut first_error = None;

        for day in [today - Duration::days(1), today] {
            match self.store.refresh_day(day).await {
                Ok(row) => {
                    debug!(period = %day, total = row.last_files_total, "Analytics day refreshed");
                    self.metrics.inc_analytics_days_refreshed();
                    refreshed.push(row);
                }
                Err(e) => {
                    warn!(period = %day, error = %e, "Failed to refresh analytics day");
                    self.metrics.inc_analytics_errors();
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(refreshed),
        }
    }

    /// The last `days` stored rows ending at the day of `now`, oldest first.
    pub async fn recent(&self, now: DateTime<Utc>, days: u32) -> Result<Vec<AnalyticsDay>, DbError> {
        let end: NaiveDate = now.date_naive();
        let start = end - Duration::days(i64::from(days.saturating_sub(1)));
        self.store.range(start, end).await
    }
}

impl PeriodicJob for AnalyticsJob {
    async fn run_once(&self) {
        if let Ok(days) = self.refresh_at(Utc::now()).await {
            info!(days = days.len(), "Analytics refreshed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_db::{ArchiveDb, LastFile, LastFileStatus};

    #[tokio::test]
    async fn test_refresh_stores_yesterday_and_today() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        let now = Utc::now();

        let mut today = LastFile::received("t1", "t1.last", 0.8, now, Default::default());
        today.status = LastFileStatus::Archived;
        db.last_files().create(&today).await.unwrap();

        let mut yesterday = LastFile::received("y1", "y1.last", 0.4, now, Default::default());
        yesterday.created_at = now - Duration::days(1);
        yesterday.status = LastFileStatus::Failed;
        db.last_files().create(&yesterday).await.unwrap();

        let metrics = Arc::new(ServiceMetrics::new());
        let job = AnalyticsJob::new(db.analytics(), Arc::clone(&metrics));
        let refreshed = job.refresh_at(now).await.unwrap();
        assert_eq!(refreshed.len(), 2);

        let stored = db.analytics().get_day(now.date_naive()).await.unwrap().unwrap();
        assert_eq!(stored.last_files_total, 1);
        assert_eq!(stored.last_files_archived, 1);

        let recent = job.recent(now, 7).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].period, now.date_naive() - Duration::days(1));
        assert_eq!(recent[0].last_files_failed, 1);
        assert_eq!(metrics.snapshot().analytics_days_refreshed, 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_counted() {
        let db = ArchiveDb::open_in_memory().await.unwrap();
        sqlx::query("DROP TABLE analytics_daily")
            .execute(db.pool())
            .await
            .unwrap();

        let metrics = Arc::new(ServiceMetrics::new());
        let job = AnalyticsJob::new(db.analytics(), Arc::clone(&metrics));
        assert!(job.refresh_at(Utc::now()).await.is_err());
        job.run_once().await;
        assert_eq!(metrics.snapshot().analytics_errors, 4);
        assert_eq!(metrics.snapshot().analytics_days_refreshed, 0);
    }
}
