//! Adapters between transport legs and the forwarding loop.
//!
//! The forwarding loop is written against `FrameSource` and `FrameSink`
//! traits; these adapters bind them to real legs: a remote WebRTC track
//! as a source, the local outbound track as an encoded sink, and the
//! model session as a PCM sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};
use voicebridge_media_core::{Error as MediaError, FrameSink, FrameSource, SinkFrame};
use voicebridge_rtc_core::{Sample, TrackLocalStaticSample, TrackRemote};

use crate::delegate::ModelSession;

/// Frames read off a remote WebRTC audio track.
pub struct RemoteTrackSource {
    track: Arc<TrackRemote>,
    closed: Arc<AtomicBool>,
}

impl RemoteTrackSource {
    /// Wrap a remote track; `closed` is the connection's flag.
    pub fn new(track: Arc<TrackRemote>, closed: Arc<AtomicBool>) -> Self {
        Self { track, closed }
    }
}

#[async_trait]
impl FrameSource for RemoteTrackSource {
    async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            match self.track.read_rtp().await {
                Ok((packet, _attributes)) => {
                    // Keepalive packets with no payload are not frames.
                    if packet.payload.is_empty() {
                        trace!(ssrc = self.track.ssrc(), "empty RTP payload skipped");
                        continue;
                    }
                    return Some(packet.payload);
                }
                Err(e) => {
                    debug!(ssrc = self.track.ssrc(), "remote track ended: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Encoded frames written onto a local outbound track.
pub struct LocalTrackSink {
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrackSink {
    /// Wrap the connection's outbound track.
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl FrameSink for LocalTrackSink {
    fn wants_pcm(&self) -> bool {
        false
    }

    async fn write(&self, frame: SinkFrame) -> voicebridge_media_core::Result<()> {
        let (payload, duration) = match frame {
            SinkFrame::Encoded { payload, duration } => (payload, duration),
            SinkFrame::Pcm(_) => {
                return Err(MediaError::WriteFailed(
                    "track sink takes encoded frames".to_string(),
                ))
            }
        };

        self.track
            .write_sample(&Sample {
                data: payload,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| match e {
                webrtc::Error::ErrClosedPipe => MediaError::SinkClosed,
                other => MediaError::WriteFailed(other.to_string()),
            })
    }
}

/// Decoded PCM pushed into the model session.
pub struct ModelAudioSink {
    model: Arc<dyn ModelSession>,
}

impl ModelAudioSink {
    /// Wrap the connection's model leg.
    pub fn new(model: Arc<dyn ModelSession>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl FrameSink for ModelAudioSink {
    fn wants_pcm(&self) -> bool {
        true
    }

    async fn write(&self, frame: SinkFrame) -> voicebridge_media_core::Result<()> {
        let pcm = match frame {
            SinkFrame::Pcm(pcm) => pcm,
            SinkFrame::Encoded { .. } => {
                return Err(MediaError::WriteFailed(
                    "model sink takes PCM frames".to_string(),
                ))
            }
        };

        if !self.model.is_connected() {
            return Err(MediaError::SinkClosed);
        }
        self.model
            .send_audio(&pcm)
            .await
            .map_err(|e| MediaError::WriteFailed(e.to_string()))
    }
}

/// Nominal duration of one forwarded frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
