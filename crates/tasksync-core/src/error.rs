//! Error types for tasksync-core

use thiserror::Error;

use crate::validation::ValidationError;

/// Result type alias using tasksync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tasksync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request payload failed schema validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Caller tried to touch a row it does not own
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation is not defined for the entity type
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
