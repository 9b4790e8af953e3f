//! Canonical default values shared by the service and its tooling.

pub const DEFAULT_BROKER_URL: &str = "tcp://127.0.0.1:5560";
pub const DEFAULT_SUBJECT: &str = "lastfile.created";
pub const DEFAULT_QUEUE_GROUP: &str = "archive-service";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:archive.sqlite3";
pub const BROKER_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Success rates below this raise a low-success alert.
pub const SUCCESS_RATE_ALERT_THRESHOLD: f64 = 0.70;
/// Lower bound of the `success:high` bucket.
pub const SUCCESS_RATE_HIGH_THRESHOLD: f64 = 0.90;

/// A `processing` LastFile untouched for this long may be claimed by a
/// redelivery.
pub const PROCESSING_STALE_SECS: u64 = 10 * 60;

pub const ANALYTICS_INTERVAL_SECS: u64 = 60 * 60;
/// Days shown by `archivist stats`, today included.
pub const ANALYTICS_STATS_DAYS: u32 = 7;

/// Retention selects at most this many records per policy per pass.
pub const RETENTION_BATCH_LIMIT: i64 = 1000;
pub const RETENTION_INTERVAL_SECS: u64 = 24 * 60 * 60;

pub const BACKUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const BACKUP_RETENTION_DAYS: u64 = 7;
pub const BACKUP_FILE_PREFIX: &str = "archive";
pub const BACKUP_FILE_EXTENSION: &str = "db";

pub const DB_MAX_CONNECTIONS: u32 = 10;
pub const DB_MIN_CONNECTIONS: u32 = 1;
pub const DB_MAX_LIFETIME_SECS: u64 = 30 * 60;
pub const DB_IDLE_TIMEOUT_SECS: u64 = 5 * 60;
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

pub const STORE_WRITE_TIMEOUT_SECS: u64 = 5;
pub const STORE_READ_TIMEOUT_SECS: u64 = 10;
pub const STORE_SEARCH_TIMEOUT_SECS: u64 = 15;
