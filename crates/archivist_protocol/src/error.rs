//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Reasons an inbound notification is rejected.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame count: expected {expected}, got {got}")]
    InvalidFrameCount { expected: usize, got: usize },

    #[error("Subject frame is not valid UTF-8")]
    InvalidSubject,

    #[error("Notification id is empty")]
    EmptyId,

    #[error("Notification file_path is empty (id {0})")]
    EmptyFilePath(String),

    #[error("Success rate {rate} out of range [0, 1] (id {id})")]
    SuccessRateOutOfRange { id: String, rate: f64 },
}
