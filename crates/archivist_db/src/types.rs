//! Record types persisted by the stores.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form JSON object attached to records.
pub type Metadata = Map<String, Value>;

// ============================================================================
// LastFile
// ============================================================================

/// Status of a received LastFile.
///
/// `received -> processing -> archived | failed`. The retention engine may
/// also move any status to `archived` before deleting the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastFileStatus {
    Received,
    Processing,
    Archived,
    Failed,
}

impl LastFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "received" => Some(Self::Received),
            "processing" => Some(Self::Processing),
            "archived" => Some(Self::Archived),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived | Self::Failed)
    }
}

impl std::fmt::Display for LastFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A received result artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFile {
    pub id: String,
    pub file_path: String,
    pub success_rate: f64,
    /// Producer timestamp carried by the notification.
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub atlas_id: Option<String>,
    pub status: LastFileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LastFile {
    /// New record in `received` state, created now.
    pub fn received(
        id: impl Into<String>,
        file_path: impl Into<String>,
        success_rate: f64,
        timestamp: DateTime<Utc>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            file_path: file_path.into(),
            success_rate,
            timestamp,
            metadata,
            atlas_id: None,
            status: LastFileStatus::Received,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate over all LastFile success rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessRateStats {
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub total: i64,
}

// ============================================================================
// Atlas
// ============================================================================

/// Status of an Atlas record. `active` moves forward only, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtlasStatus {
    Active,
    Archived,
    Deleted,
}

impl AtlasStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: AtlasStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Archived) | (Self::Active, Self::Deleted)
        )
    }
}

impl std::fmt::Display for AtlasStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Detailed segment results carried by Atlas records that came from the
/// segmentation pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentDetail {
    pub version: i32,
    pub processing_time_ms: i64,
    pub token_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_summary: Option<String>,
}

/// Derived, searchable artifact produced from a LastFile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atlas {
    pub id: String,
    pub last_file_id: String,
    pub success_rate: f64,
    pub metadata: Metadata,
    /// Unique tags, in derivation order.
    pub tags: Vec<String>,
    pub segment: Option<SegmentDetail>,
    pub status: AtlasStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Segment-results shape used by the segmentation pipeline.
///
/// Converts to and from [`Atlas`] without loss of the fields both share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtlasSegmentRecord {
    pub id: String,
    pub archive_id: String,
    pub version: i32,
    pub success_rate: f64,
    pub processing_time_ms: i64,
    pub token_count: i64,
    pub prompt_summary: Option<String>,
    pub tags: Vec<String>,
    pub custom_metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl From<AtlasSegmentRecord> for Atlas {
    fn from(record: AtlasSegmentRecord) -> Self {
        let mut tags: Vec<String> = Vec::with_capacity(record.tags.len());
        for tag in record.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Atlas {
            id: record.id,
            last_file_id: record.archive_id,
            success_rate: record.success_rate,
            metadata: record.custom_metadata,
            tags,
            segment: Some(SegmentDetail {
                version: record.version,
                processing_time_ms: record.processing_time_ms,
                token_count: record.token_count,
                prompt_summary: record.prompt_summary,
            }),
            status: AtlasStatus::Active,
            created_at: record.created_at,
            updated_at: record.created_at,
        }
    }
}

impl From<&Atlas> for AtlasSegmentRecord {
    fn from(atlas: &Atlas) -> Self {
        let segment = atlas.segment.clone().unwrap_or_default();
        AtlasSegmentRecord {
            id: atlas.id.clone(),
            archive_id: atlas.last_file_id.clone(),
            version: segment.version,
            success_rate: atlas.success_rate,
            processing_time_ms: segment.processing_time_ms,
            token_count: segment.token_count,
            prompt_summary: segment.prompt_summary,
            tags: atlas.tags.clone(),
            custom_metadata: atlas.metadata.clone(),
            created_at: atlas.created_at,
        }
    }
}

/// Occurrences of one tag across Atlas records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

// ============================================================================
// Tag catalog
// ============================================================================

/// Normalized catalog entry used for faceted listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Analytics
// ============================================================================

/// Per-day aggregate over LastFile and Atlas records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsDay {
    pub period: NaiveDate,
    pub last_files_total: i64,
    pub last_files_archived: i64,
    pub last_files_failed: i64,
    pub atlas_created: i64,
    pub average_success_rate: f64,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            LastFileStatus::Received,
            LastFileStatus::Processing,
            LastFileStatus::Archived,
            LastFileStatus::Failed,
        ] {
            assert_eq!(LastFileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AtlasStatus::parse("ACTIVE"), Some(AtlasStatus::Active));
        assert_eq!(AtlasStatus::parse("gone"), None);
    }

    #[test]
    fn test_atlas_status_is_forward_only() {
        assert!(AtlasStatus::Active.can_transition_to(AtlasStatus::Archived));
        assert!(AtlasStatus::Active.can_transition_to(AtlasStatus::Deleted));
        assert!(!AtlasStatus::Archived.can_transition_to(AtlasStatus::Active));
        assert!(!AtlasStatus::Deleted.can_transition_to(AtlasStatus::Archived));
        assert!(!AtlasStatus::Active.can_transition_to(AtlasStatus::Active));
    }

    #[test]
    fn test_segment_record_maps_to_atlas() {
        let created = Utc::now();
        let record = AtlasSegmentRecord {
            id: "a1".to_string(),
            archive_id: "lf1".to_string(),
            version: 2,
            success_rate: 0.8,
            processing_time_ms: 1200,
            token_count: 512,
            prompt_summary: Some("invoice totals".to_string()),
            tags: vec!["x".to_string(), "y".to_string(), "x".to_string()],
            custom_metadata: Metadata::new(),
            created_at: created,
        };

        let atlas = Atlas::from(record.clone());
        assert_eq!(atlas.last_file_id, "lf1");
        assert_eq!(atlas.tags, vec!["x", "y"]);
        assert_eq!(atlas.status, AtlasStatus::Active);
        assert_eq!(atlas.segment.as_ref().map(|s| s.token_count), Some(512));

        let back = AtlasSegmentRecord::from(&atlas);
        assert_eq!(back.archive_id, record.archive_id);
        assert_eq!(back.prompt_summary, record.prompt_summary);
        assert_eq!(back.tags, vec!["x", "y"]);
    }

    #[test]
    fn test_atlas_without_segment_maps_to_defaults() {
        let now = Utc::now();
        let atlas = Atlas {
            id: "a2".to_string(),
            last_file_id: "lf2".to_string(),
            success_rate: 0.4,
            metadata: Metadata::new(),
            tags: vec!["success:low".to_string()],
            segment: None,
            status: AtlasStatus::Archived,
            created_at: now,
            updated_at: now,
        };
        let record = AtlasSegmentRecord::from(&atlas);
        assert_eq!(record.version, 0);
        assert_eq!(record.token_count, 0);
        assert!(record.prompt_summary.is_none());
    }
}
