//! Success-rate policy and tag derivation.

use archivist_protocol::defaults::{SUCCESS_RATE_ALERT_THRESHOLD, SUCCESS_RATE_HIGH_THRESHOLD};
use archivist_protocol::Notification;
use tracing::warn;

const BUCKET_TAG_PREFIX: &str = "success:";

/// Success-rate bucket attached to every Atlas as a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuccessBucket {
    High,
    Medium,
    Low,
}

impl SuccessBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn tag(&self) -> String {
        format!("{}{}", BUCKET_TAG_PREFIX, self.as_str())
    }
}

impl std::fmt::Display for SuccessBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `r >= 0.90` is high, `0.70 <= r < 0.90` medium, anything else low.
pub fn classify(rate: f64) -> SuccessBucket {
    if rate >= SUCCESS_RATE_HIGH_THRESHOLD {
        SuccessBucket::High
    } else if rate >= SUCCESS_RATE_ALERT_THRESHOLD {
        SuccessBucket::Medium
    } else {
        SuccessBucket::Low
    }
}

/// Tags for the Atlas derived from `notification`, in order:
/// `metadata["tags"]` strings, `type:<command_type>`, then the bucket tag.
/// Duplicates keep their first position. Incoming `success:*` tags are
/// dropped so the computed bucket is the only one.
pub fn derive_tags(notification: &Notification) -> Vec<String> {
    let mut candidates: Vec<String> = notification
        .metadata_tags()
        .into_iter()
        .filter(|tag| !tag.starts_with(BUCKET_TAG_PREFIX))
        .map(str::to_string)
        .collect();
    if let Some(command_type) = notification.command_type() {
        candidates.push(format!("type:{}", command_type));
    }
    candidates.push(classify(notification.success_rate).tag());

    let mut tags = Vec::with_capacity(candidates.len());
    for tag in candidates {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Outcome of the archival policy for one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub bucket: SuccessBucket,
    pub tags: Vec<String>,
    /// Below the alert threshold. Conversion still proceeds.
    pub low_success: bool,
}

/// Side channel for low success-rate notifications.
pub trait AlertSink: Send + Sync {
    fn low_success_rate(&self, notification: &Notification, threshold: f64);
}

/// Default sink: a structured warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn low_success_rate(&self, notification: &Notification, threshold: f64) {
        warn!(
            id = %notification.id,
            file_path = %notification.file_path,
            success_rate = notification.success_rate,
            threshold,
            "LastFile success rate below threshold"
        );
    }
}

/// Applies the success-rate policy and computes derived artifacts.
#[derive(Debug, Clone, Copy)]
pub struct ArchivalProcessor {
    alert_threshold: f64,
}

impl Default for ArchivalProcessor {
    fn default() -> Self {
        Self {
            alert_threshold: SUCCESS_RATE_ALERT_THRESHOLD,
        }
    }
}

impl ArchivalProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alert_threshold(&self) -> f64 {
        self.alert_threshold
    }

    pub fn evaluate(&self, notification: &Notification) -> Evaluation {
        Evaluation {
            bucket: classify(notification.success_rate),
            tags: derive_tags(notification),
            low_success: notification.success_rate < self.alert_threshold,
        }
    }
}
