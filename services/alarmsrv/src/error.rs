//! Error types for AlarmSrv

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AlarmError>;

#[derive(Debug, Error)]
pub enum AlarmError {
    /// SQLite operation error
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored rule or policy that does not validate
    #[error("Invalid rule data: {0}")]
    InvalidRule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for AlarmError {
    fn from(err: sqlx::Error) -> Self {
        AlarmError::Database(err.to_string())
    }
}

impl From<common::Error> for AlarmError {
    fn from(err: common::Error) -> Self {
        AlarmError::Config(err.to_string())
    }
}

impl From<aqua_rules::RuleError> for AlarmError {
    fn from(err: aqua_rules::RuleError) -> Self {
        AlarmError::InvalidRule(err.to_string())
    }
}
