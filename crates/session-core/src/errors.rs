//! Error types for session management.

use thiserror::Error;

use crate::types::ConnectionId;

/// Errors raised by the session layer.
///
/// Timer-driven termination is deliberately absent: timeouts are policy,
/// expressed as termination events carrying a reason, not errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No connection with this id is registered.
    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    /// A connection with this id already exists.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// The model leg rejected or lost a message.
    #[error("Model session error: {0}")]
    ModelSession(String),

    /// Transport negotiation or I/O failed; fatal to call setup.
    #[error("Transport error: {0}")]
    Transport(#[from] voicebridge_rtc_core::Error),

    /// Media path setup failed.
    #[error("Media error: {0}")]
    Media(#[from] voicebridge_media_core::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal channel or task failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, SessionError>;
