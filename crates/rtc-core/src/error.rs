//! Error types for session negotiation.

use thiserror::Error;

/// Errors produced while negotiating or operating a peer session.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote description failed basic structural validation.
    #[error("Malformed SDP: {0}")]
    MalformedSdp(String),

    /// Offer/answer exchange failed partway through.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The underlying WebRTC stack reported an error.
    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),

    /// The control channel is not open yet or was closed by the peer.
    #[error("Control channel unavailable: {0}")]
    ControlChannel(String),

    /// Invalid negotiator configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
