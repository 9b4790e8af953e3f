//! Per-day aggregates over LastFile and Atlas records.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{Row, Statement};

use crate::cache::NamedStatement;
use crate::error::{DbError, Result};
use crate::pool::DbRow;
use crate::types::AnalyticsDay;
use crate::{millis_to_datetime, timed, ArchiveDb};

const PERIOD_FORMAT: &str = "%Y-%m-%d";

const LAST_FILE_TOTALS: NamedStatement = NamedStatement::new(
    "analytics.last_file_totals",
    r#"
    SELECT
        COUNT(*) AS total,
        SUM(CASE WHEN status = 'archived' THEN 1 ELSE 0 END) AS archived,
        SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
        AVG(success_rate) AS average
    FROM last_files
    WHERE created_at >= ? AND created_at < ?
    "#,
);

const ATLAS_CREATED: NamedStatement = NamedStatement::new(
    "analytics.atlas_created",
    "SELECT COUNT(*) AS total FROM atlas_files WHERE created_at >= ? AND created_at < ?",
);

const UPSERT: NamedStatement = NamedStatement::new(
    "analytics.upsert",
    r#"
    INSERT INTO analytics_daily
        (period, last_files_total, last_files_archived, last_files_failed,
         atlas_created, average_success_rate, computed_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(period) DO UPDATE SET
        last_files_total = excluded.last_files_total,
        last_files_archived = excluded.last_files_archived,
        last_files_failed = excluded.last_files_failed,
        atlas_created = excluded.atlas_created,
        average_success_rate = excluded.average_success_rate,
        computed_at = excluded.computed_at
    "#,
);

const GET_DAY: NamedStatement = NamedStatement::new(
    "analytics.get_day",
    "SELECT * FROM analytics_daily WHERE period = ?",
);

const RANGE: NamedStatement = NamedStatement::new(
    "analytics.range",
    "SELECT * FROM analytics_daily WHERE period >= ? AND period <= ? ORDER BY period",
);

pub(crate) const STATEMENTS: &[NamedStatement] =
    &[LAST_FILE_TOTALS, ATLAS_CREATED, UPSERT, GET_DAY, RANGE];

#[derive(Clone)]
pub struct AnalyticsStore {
    db: ArchiveDb,
}

impl AnalyticsStore {
    pub(crate) fn new(db: ArchiveDb) -> Self {
        Self { db }
    }

    /// Aggregate records created during the UTC day `day`. Nothing is stored.
    pub async fn compute_for_day(&self, day: NaiveDate) -> Result<AnalyticsDay> {
        let (start, end) = day_bounds(day);

        timed("analytics.compute_for_day", self.db.timeouts().search, async {
            let totals = self.db.statement(&LAST_FILE_TOTALS).await?;
            let row = totals
                .query()
                .bind(start)
                .bind(end)
                .fetch_one(self.db.pool())
                .await?;

            let atlas = self.db.statement(&ATLAS_CREATED).await?;
            let atlas_created: i64 = atlas
                .query()
                .bind(start)
                .bind(end)
                .fetch_one(self.db.pool())
                .await?
                .try_get("total")?;

            Ok(AnalyticsDay {
                period: day,
                last_files_total: row.try_get("total")?,
                last_files_archived: row.try_get::<Option<i64>, _>("archived")?.unwrap_or(0),
                last_files_failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
                atlas_created,
                average_success_rate: row.try_get::<Option<f64>, _>("average")?.unwrap_or(0.0),
                computed_at: Utc::now(),
            })
        })
        .await
    }

    pub async fn upsert_day(&self, day: &AnalyticsDay) -> Result<()> {
        let period = day.period.format(PERIOD_FORMAT).to_string();
        timed("analytics.upsert_day", self.db.timeouts().write, async {
            let stmt = self.db.statement(&UPSERT).await?;
            stmt.query()
                .bind(&period)
                .bind(day.last_files_total)
                .bind(day.last_files_archived)
                .bind(day.last_files_failed)
                .bind(day.atlas_created)
                .bind(day.average_success_rate)
                .bind(day.computed_at.timestamp_millis())
                .execute(self.db.pool())
                .await?;
            Ok(())
        })
        .await
    }

    /// Compute and store the aggregate for `day`.
    pub async fn refresh_day(&self, day: NaiveDate) -> Result<AnalyticsDay> {
        let computed = self.compute_for_day(day).await?;
        self.upsert_day(&computed).await?;
        Ok(computed)
    }

    pub async fn get_day(&self, day: NaiveDate) -> Result<Option<AnalyticsDay>> {
        let period = day.format(PERIOD_FORMAT).to_string();
        timed("analytics.get_day", self.db.timeouts().read, async {
            let stmt = self.db.statement(&GET_DAY).await?;
            let row = stmt.query().bind(&period).fetch_optional(self.db.pool()).await?;
            row.as_ref().map(row_to_day).transpose()
        })
        .await
    }

    /// Stored days between `start` and `end`, inclusive, oldest first.
    pub async fn range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<AnalyticsDay>> {
        let start = start.format(PERIOD_FORMAT).to_string();
        let end = end.format(PERIOD_FORMAT).to_string();
        timed("analytics.range", self.db.timeouts().read, async {
            let stmt = self.db.statement(&RANGE).await?;
            let rows = stmt
                .query()
                .bind(&start)
                .bind(&end)
                .fetch_all(self.db.pool())
                .await?;
            rows.iter().map(row_to_day).collect()
        })
        .await
    }
}

fn day_bounds(day: NaiveDate) -> (i64, i64) {
    let start: DateTime<Utc> = day.and_time(chrono::NaiveTime::MIN).and_utc();
    let end = start + Duration::days(1);
    (start.timestamp_millis(), end.timestamp_millis())
}

fn row_to_day(row: &DbRow) -> Result<AnalyticsDay> {
    let period: String = row.try_get("period")?;
    let period = NaiveDate::parse_from_str(&period, PERIOD_FORMAT)
        .map_err(|e| DbError::invalid_state(format!("Bad analytics period {}: {}", period, e)))?;

    Ok(AnalyticsDay {
        period,
        last_files_total: row.try_get("last_files_total")?,
        last_files_archived: row.try_get("last_files_archived")?,
        last_files_failed: row.try_get("last_files_failed")?,
        atlas_created: row.try_get("atlas_created")?,
        average_success_rate: row.try_get("average_success_rate")?,
        computed_at: millis_to_datetime(row.try_get("computed_at")?),
    })
}
