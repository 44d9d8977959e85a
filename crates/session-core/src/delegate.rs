//! Collaborator traits at the AI-backend seam.
//!
//! The orchestrator talks to the speech model and to per-deployment
//! conversation policy through traits, so one bridge binary can serve
//! different backends. [`PeerModelSession`] is the WebRTC-backed model
//! leg used in production.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use voicebridge_media_core::codec::FRAME_SAMPLES_20MS;
use voicebridge_media_core::OpusAudioCodec;
use voicebridge_rtc_core::{PeerSession, Sample};

use crate::errors::{Result, SessionError};
use crate::types::{ConnectionId, TerminationReason};

/// Conversation policy hooks, one implementation per AI backend.
///
/// Each hook returns the control message to send, or `None` to stay
/// quiet. Payloads are backend-shaped JSON; the bridge never interprets
/// them.
#[async_trait]
pub trait CallBridgeDelegate: Send + Sync {
    /// Message sent once the connection becomes ready.
    async fn greeting(&self, id: ConnectionId) -> Option<serde_json::Value>;

    /// Message nudging a silent caller. `retry` counts prior prompts.
    async fn inactivity_prompt(&self, id: ConnectionId, retry: u32) -> Option<serde_json::Value>;

    /// Message spoken before teardown.
    async fn farewell(&self, id: ConnectionId, reason: TerminationReason)
        -> Option<serde_json::Value>;
}

/// The model leg of a bridged call.
#[async_trait]
pub trait ModelSession: Send + Sync {
    /// Send one frame of 48 kHz mono PCM.
    async fn send_audio(&self, pcm: &[i16]) -> Result<()>;

    /// Send a JSON control message.
    async fn send_control_message(&self, message: &serde_json::Value) -> Result<()>;

    /// Whether the session transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Tear the session down.
    async fn close(&self) -> Result<()>;
}

/// Reports whether a tool call is keeping the model busy for a
/// connection. Consumed by the background-audio gate and the silence
/// timer.
pub trait ToolCallGate: Send + Sync {
    /// Whether a tool call is currently in flight.
    fn is_call_in_flight(&self, id: ConnectionId) -> bool;
}

/// Gate for deployments without tool calling.
pub struct NoToolCalls;

impl ToolCallGate for NoToolCalls {
    fn is_call_in_flight(&self, _id: ConnectionId) -> bool {
        false
    }
}

/// [`ModelSession`] backed by a negotiated [`PeerSession`]: PCM is
/// encoded to Opus onto the outbound track, control messages go over
/// the data channel.
pub struct PeerModelSession {
    session: Arc<PeerSession>,
    encoder: Mutex<OpusAudioCodec>,
}

impl PeerModelSession {
    /// Wrap a negotiated session.
    pub fn new(session: Arc<PeerSession>, bitrate: Option<i32>) -> Result<Self> {
        Ok(Self {
            session,
            encoder: Mutex::new(OpusAudioCodec::new(bitrate)?),
        })
    }
}

#[async_trait]
impl ModelSession for PeerModelSession {
    async fn send_audio(&self, pcm: &[i16]) -> Result<()> {
        if pcm.len() % FRAME_SAMPLES_20MS != 0 {
            return Err(SessionError::ModelSession(format!(
                "audio must be whole 20 ms frames, got {} samples",
                pcm.len()
            )));
        }

        let mut encoder = self.encoder.lock().await;
        for frame in pcm.chunks_exact(FRAME_SAMPLES_20MS) {
            let payload = encoder.encode(frame)?;
            self.session
                .write_audio(&Sample {
                    data: payload,
                    duration: std::time::Duration::from_millis(20),
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }

    async fn send_control_message(&self, message: &serde_json::Value) -> Result<()> {
        let text = message.to_string();
        self.session
            .send_control_text(&text)
            .await
            .map_err(|e| SessionError::ModelSession(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await?;
        Ok(())
    }
}
