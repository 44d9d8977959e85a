//! Audio transcoding and frame forwarding for voicebridge.
//!
//! This crate owns the per-connection media path: reading discrete Opus
//! frames from one leg, deciding per frame whether to forward (DTX
//! sparsification, duplicate suppression, suppression gate), transcoding to
//! PCM when the destination needs it, and masking dead air with a
//! pre-encoded background clip while slow backend calls are in flight.
//!
//! The forwarding loop is written against the [`types::FrameSource`] and
//! [`types::FrameSink`] traits so it runs identically over real media
//! tracks and synthetic test streams.

pub mod bridge;
pub mod cache;
pub mod codec;
pub mod error;
pub mod types;

pub use bridge::background::{BackgroundAudioInjector, BackgroundClip};
pub use bridge::filter::{DropReason, ForwardFilter, ForwardFilterConfig, FrameDecision};
pub use bridge::{CodecBridge, CodecBridgeConfig, ForwardStats};
pub use cache::{AudioCache, NoopAudioCache};
pub use codec::OpusAudioCodec;
pub use error::{Error, Result};
pub use types::{ActivityClock, FrameFormat, FrameSink, FrameSource, SinkFrame, StreamRole};
