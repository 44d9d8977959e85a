//! Shared infrastructure error types.

use thiserror::Error;

/// Errors raised by infrastructure components (logging, configuration).
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Logging subsystem failure
    #[error("logging error: {0}")]
    Logging(String),
}

/// Result alias for infrastructure operations.
pub type Result<T> = std::result::Result<T, Error>;
