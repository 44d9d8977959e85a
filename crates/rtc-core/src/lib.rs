//! WebRTC session negotiation for the voicebridge stack.
//!
//! This crate owns the transport leg of a bridged call: it builds an
//! Opus-only peer connection, answers or produces SDP, forces the DTLS
//! handshake role expected by telephony gateways, and mirrors the remote
//! peer's control-channel layout so both sides agree on the media plan.
//!
//! The inspection of raw SDP (relay-only detection, channel counting,
//! sanity validation) lives in [`sdp`] as pure functions so it can be
//! tested without standing up a peer connection.

mod config;
mod error;
mod negotiator;
mod peer;
pub mod sdp;

pub use config::{IceServerConfig, NegotiatorConfig};
pub use error::{Error, Result};
pub use negotiator::SessionNegotiator;
pub use peer::{GatheringOutcome, PeerSession, PeerSessionEvents};

// Re-exported so downstream crates can consume tracks and channels
// without depending on the webrtc crate directly.
pub use webrtc::data_channel::RTCDataChannel;
pub use webrtc::media::Sample;
pub use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
pub use webrtc::track::track_remote::TrackRemote;
