//! Rule Error Types

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule model errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Unknown comparison operator
    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    /// Threshold that is not a number
    #[error("Invalid threshold for {parameter}: {value}")]
    InvalidThreshold { parameter: String, value: String },

    /// Condition without a parameter name
    #[error("Condition has no parameter")]
    MissingParameter,

    /// Unknown alert status string
    #[error("Invalid alert status: {0}")]
    InvalidStatus(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::SerializationError(err.to_string())
    }
}
