//! Core media types: stream roles, source/sink traits, activity tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Which leg of the bridge a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Audio arriving from the telephony peer, destined for the model
    TelephonyInbound,
    /// Audio arriving from the model, destined for the telephony peer
    ModelInbound,
}

impl StreamRole {
    /// Stable string form used in logs and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TelephonyInbound => "telephony-inbound",
            Self::ModelInbound => "model-inbound",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload format of a frame handed to a sink or the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Opus-encoded frame
    Opus,
    /// Linear 16-bit PCM, 48 kHz mono
    Pcm16,
}

/// A frame in the representation the destination sink consumes.
#[derive(Debug, Clone)]
pub enum SinkFrame {
    /// Pass-through encoded frame with its nominal duration
    Encoded {
        /// Opus payload bytes
        payload: Bytes,
        /// Nominal frame duration (20 ms unless the source says otherwise)
        duration: Duration,
    },
    /// Decoded linear PCM, 48 kHz mono
    Pcm(Vec<i16>),
}

/// Source of discrete compressed audio frames, one leg's inbound track.
///
/// `next_frame` suspends until a frame arrives; `None` means the stream
/// ended (peer hung up or track closed).
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Bytes>;
}

/// Destination for forwarded frames, the peer leg's outbound channel.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Whether this sink consumes decoded PCM rather than Opus frames.
    fn wants_pcm(&self) -> bool;

    /// Write one frame. [`crate::Error::SinkClosed`] ends the forwarding
    /// loop; any other error is logged and the loop continues.
    async fn write(&self, frame: SinkFrame) -> Result<()>;
}

/// Lock-free last-audio-activity timestamp.
///
/// Written by the hot forwarding path on every forwarded real frame and
/// read by timer callbacks, so it is a plain atomic rather than a lock.
/// Measured against the runtime clock so paused-time tests see it.
#[derive(Debug)]
pub struct ActivityClock {
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl ActivityClock {
    /// Create a clock whose last activity is "now".
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Record audio activity at the current instant.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Whether activity was recorded within the given window.
    pub fn active_within(&self, window: Duration) -> bool {
        self.idle() < window
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn activity_clock_tracks_idle_time() {
        let clock = ActivityClock::new();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!clock.active_within(Duration::from_secs(1)));

        clock.touch();
        assert!(clock.active_within(Duration::from_secs(1)));
        assert!(clock.idle() < Duration::from_millis(500));
    }

    #[test]
    fn stream_role_strings() {
        assert_eq!(StreamRole::TelephonyInbound.as_str(), "telephony-inbound");
        assert_eq!(StreamRole::ModelInbound.to_string(), "model-inbound");
    }
}
