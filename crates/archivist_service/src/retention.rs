//! Retention engine.
//!
//! For each configured data type, selects a bounded batch of records created
//! before `now - retention_days`, optionally archives them, then deletes
//! them. Every per-record failure is logged and counted; none aborts the
//! batch or the remaining policies.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use archivist_db::{AtlasStatus, AtlasStore, DbError, LastFileStatus, LastFileStore};
use archivist_protocol::defaults::RETENTION_BATCH_LIMIT;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::metrics::ServiceMetrics;
use crate::scheduler::PeriodicJob;

/// Entity type a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    LastFiles,
    AtlasFiles,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastFiles => "last_files",
            Self::AtlasFiles => "atlas_files",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_files" => Ok(Self::LastFiles),
            "atlas_files" => Ok(Self::AtlasFiles),
            other => Err(format!("Unknown retention data type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub data_type: DataType,
    pub retention_days: u32,
    #[serde(default)]
    pub archive_first: bool,
}

impl RetentionPolicy {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days))
    }
}

/// A record selected for retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    /// Not yet in an archived state.
    pub needs_archive: bool,
    /// File to remove once the row is gone.
    pub file_path: Option<PathBuf>,
}

/// Store operations the engine needs for one data type.
pub trait RetentionTarget: Send + Sync {
    fn candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Candidate>, DbError>> + Send;

    fn archive(&self, id: &str) -> impl Future<Output = Result<(), DbError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), DbError>> + Send;
}

impl RetentionTarget for LastFileStore {
    async fn candidates(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Candidate>, DbError> {
        let files = self.older_than(cutoff, limit).await?;
        Ok(files
            .into_iter()
            .map(|file| Candidate {
                // `archived` means converted; a record never linked to an
                // Atlas is deleted without passing through it.
                needs_archive: file.status != LastFileStatus::Archived && file.atlas_id.is_some(),
                file_path: (!file.file_path.is_empty()).then(|| PathBuf::from(&file.file_path)),
                id: file.id,
            })
            .collect())
    }

    async fn archive(&self, id: &str) -> Result<(), DbError> {
        self.update_status(id, LastFileStatus::Archived).await
    }

    async fn delete(&self, id: &str) -> Result<(), DbError> {
        LastFileStore::delete(self, id).await
    }
}

impl RetentionTarget for AtlasStore {
    async fn candidates(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Candidate>, DbError> {
        let records = self.older_than(cutoff, limit).await?;
        Ok(records
            .into_iter()
            .map(|atlas| Candidate {
                needs_archive: atlas.status == AtlasStatus::Active,
                file_path: None,
                id: atlas.id,
            })
            .collect())
    }

    async fn archive(&self, id: &str) -> Result<(), DbError> {
        AtlasStore::archive(self, id).await
    }

    async fn delete(&self, id: &str) -> Result<(), DbError> {
        AtlasStore::delete(self, id).await
    }
}

/// What one policy did in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub data_type: DataType,
    pub selected: usize,
    pub archived: usize,
    pub deleted: usize,
    /// Records left for the next pass because archiving failed.
    pub skipped: usize,
    pub files_removed: usize,
    pub errors: usize,
}

impl RetentionReport {
    fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            selected: 0,
            archived: 0,
            deleted: 0,
            skipped: 0,
            files_removed: 0,
            errors: 0,
        }
    }
}

pub struct RetentionEngine<L = LastFileStore, A = AtlasStore> {
    last_files: L,
    atlas: A,
    policies: BTreeMap<DataType, RetentionPolicy>,
    batch_limit: i64,
    metrics: Arc<ServiceMetrics>,
}

impl<L: RetentionTarget, A: RetentionTarget> RetentionEngine<L, A> {
    pub fn new(last_files: L, atlas: A, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            last_files,
            atlas,
            policies: BTreeMap::new(),
            batch_limit: RETENTION_BATCH_LIMIT,
            metrics,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: i64) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Add a policy, replacing any earlier one for the same data type.
    pub fn add_policy(&mut self, policy: RetentionPolicy) {
        info!(
            data_type = %policy.data_type,
            retention_days = policy.retention_days,
            archive_first = policy.archive_first,
            "Added retention policy"
        );
        self.policies.insert(policy.data_type, policy);
    }

    pub fn with_policies(mut self, policies: impl IntoIterator<Item = RetentionPolicy>) -> Self {
        for policy in policies {
            self.add_policy(policy);
        }
        self
    }

    pub fn policies(&self) -> impl Iterator<Item = &RetentionPolicy> {
        self.policies.values()
    }

    pub async fn apply_policies(&self) -> Vec<RetentionReport> {
        self.apply_policies_at(Utc::now()).await
    }

    /// One pass over every policy with `now` as the reference time.
    pub async fn apply_policies_at(&self, now: DateTime<Utc>) -> Vec<RetentionReport> {
        let mut reports = Vec::with_capacity(self.policies.len());
        for policy in self.policies.values() {
            info!(data_type = %policy.data_type, "Applying retention policy");
            let report = match policy.data_type {
                DataType::LastFiles => self.apply_policy(&self.last_files, policy, now).await,
                DataType::AtlasFiles => self.apply_policy(&self.atlas, policy, now).await,
            };
            self.metrics.add_retention_archived(report.archived as u64);
            self.metrics.add_retention_deleted(report.deleted as u64);
            self.metrics.add_retention_errors(report.errors as u64);
            reports.push(report);
        }
        reports
    }

    async fn apply_policy<T: RetentionTarget>(
        &self,
        target: &T,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> RetentionReport {
        let mut report = RetentionReport::new(policy.data_type);
        let cutoff = policy.cutoff(now);

        let candidates = match target.candidates(cutoff, self.batch_limit).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(data_type = %policy.data_type, error = %e, "Failed to select records for retention");
                report.errors += 1;
                return report;
            }
        };
        report.selected = candidates.len();
        info!(
            data_type = %policy.data_type,
            count = candidates.len(),
            cutoff = %cutoff,
            "Found records to process for retention policy"
        );

        for candidate in candidates {
            if policy.archive_first && candidate.needs_archive {
                if let Err(e) = target.archive(&candidate.id).await {
                    warn!(data_type = %policy.data_type, id = %candidate.id, error = %e, "Failed to archive record");
                    report.errors += 1;
                    report.skipped += 1;
                    continue;
                }
                report.archived += 1;
                debug!(data_type = %policy.data_type, id = %candidate.id, "Archived record");
            }

            if let Err(e) = target.delete(&candidate.id).await {
                warn!(data_type = %policy.data_type, id = %candidate.id, error = %e, "Failed to delete record");
                report.errors += 1;
                continue;
            }
            report.deleted += 1;
            debug!(data_type = %policy.data_type, id = %candidate.id, "Deleted record");

            if let Some(path) = &candidate.file_path {
                if remove_file_best_effort(path).await {
                    report.files_removed += 1;
                }
            }
        }

        info!(
            data_type = %report.data_type,
            selected = report.selected,
            archived = report.archived,
            deleted = report.deleted,
            errors = report.errors,
            "Retention policy applied"
        );
        report
    }
}

impl<L, A> PeriodicJob for RetentionEngine<L, A>
where
    L: RetentionTarget + 'static,
    A: RetentionTarget + 'static,
{
    async fn run_once(&self) {
        let reports = self.apply_policies().await;
        let deleted: usize = reports.iter().map(|r| r.deleted).sum();
        let errors: usize = reports.iter().map(|r| r.errors).sum();
        info!(deleted, errors, "Scheduled retention pass finished");
    }
}

/// Remove `path`. A missing file is fine; other failures are only logged.
/// Returns whether a file was removed.
async fn remove_file_best_effort(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Deleted file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}
