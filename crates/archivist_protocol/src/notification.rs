//! Inbound LastFile notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DecodeError, Result};

/// A LastFile notification as published by the upstream pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub file_path: String,
    pub success_rate: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Notification {
    /// Decode and validate a JSON message body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let notification: Notification = serde_json::from_slice(body)?;
        notification.validate()?;
        Ok(notification)
    }

    /// Encode as a JSON message body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DecodeError::EmptyId);
        }
        if self.file_path.trim().is_empty() {
            return Err(DecodeError::EmptyFilePath(self.id.clone()));
        }
        if !self.success_rate.is_finite() || !(0.0..=1.0).contains(&self.success_rate) {
            return Err(DecodeError::SuccessRateOutOfRange {
                id: self.id.clone(),
                rate: self.success_rate,
            });
        }
        Ok(())
    }

    /// String tags listed under `metadata["tags"]`, non-string entries ignored.
    pub fn metadata_tags(&self) -> Vec<&str> {
        match self.metadata.get("tags") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// `metadata["command_type"]` rendered as a string when present.
    pub fn command_type(&self) -> Option<String> {
        match self.metadata.get("command_type")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Split a `[subject, body]` multipart message and decode the body.
///
/// Returns the subject alongside the notification so the caller can apply
/// its own subject filter.
pub fn decode_frames(frames: &[Vec<u8>]) -> Result<(String, Notification)> {
    if frames.len() != 2 {
        return Err(DecodeError::InvalidFrameCount {
            expected: 2,
            got: frames.len(),
        });
    }
    let subject = std::str::from_utf8(&frames[0])
        .map_err(|_| DecodeError::InvalidSubject)?
        .to_string();
    let notification = Notification::decode(&frames[1])?;
    Ok((subject, notification))
}
