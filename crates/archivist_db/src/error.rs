//! Error types for the database layer.

use std::time::Duration;
use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Update or delete matched no row
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation (unique, check, not null)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation exceeded its deadline
    #[error("Timed out after {limit:?}: {operation}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    /// Schema migration failed
    #[error("Migration {version} failed: {message}")]
    Migration { version: i64, message: String },
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        if let sqlx::Error::Database(db_err) = &err {
            match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::CheckViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::ForeignKeyViolation => {
                    return Self::Constraint(db_err.message().to_string());
                }
                _ => {}
            }
        }
        Self::Sqlx(err)
    }
}
