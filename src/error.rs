//! Error types for the Bulwark service.

use thiserror::Error;

/// Main error type for Bulwark operations.
///
/// The rate limiter absorbs every storage variant itself; these errors only
/// reach callers from construction, configuration and store-level APIs.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected identifiers, actions or limit values
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage backend errors that are not database driver errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite driver errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Metadata (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML rules errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
