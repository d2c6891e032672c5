//! Error types for the Ratewarden engine.

use thiserror::Error;

/// Main error type for Ratewarden operations.
///
/// Throttling and "no policy applies" are not errors; they are variants of
/// [`EvaluationOutcome`](crate::ratelimit::EvaluationOutcome).
#[derive(Error, Debug)]
pub enum WardenError {
    /// A declared policy or configuration file is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Client or target identity missing at evaluation time.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// The token store backend could not be reached.
    #[error("Token store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for WardenError {
    fn from(err: ::config::ConfigError) -> Self {
        WardenError::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for WardenError {
    fn from(err: serde_yaml::Error) -> Self {
        WardenError::Configuration(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
