//! Media-core error types.

use thiserror::Error;

/// Errors raised on the media path.
///
/// Per-frame failures (decode, encode) are non-fatal to the forwarding
/// loop; only [`Error::SinkClosed`] ends it, alongside the connection's
/// closed flag and source exhaustion.
#[derive(Debug, Error)]
pub enum Error {
    /// Opus decoder failure for one frame
    #[error("opus decode failed: {0}")]
    Decode(String),

    /// Opus encoder failure for one frame
    #[error("opus encode failed: {0}")]
    Encode(String),

    /// Codec instance could not be created
    #[error("codec setup failed: {0}")]
    CodecSetup(String),

    /// Destination rejected a frame but may accept later ones
    #[error("frame write failed: {0}")]
    WriteFailed(String),

    /// Destination is gone; the forwarding loop must end
    #[error("destination sink closed")]
    SinkClosed,

    /// Background clip could not be loaded
    #[error("background clip error: {0}")]
    Clip(String),

    /// Audio cache failure (best-effort, never fatal to forwarding)
    #[error("audio cache error: {0}")]
    Cache(String),
}

/// Result alias for media operations.
pub type Result<T> = std::result::Result<T, Error>;
