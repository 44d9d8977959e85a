//! Live peer session handle.
//!
//! [`PeerSession`] wraps a negotiated `RTCPeerConnection` together with
//! the outbound audio track and the control channel. Inbound tracks,
//! control channel arrival, and control messages are surfaced through
//! the channels in [`PeerSessionEvents`] so callers can drive their own
//! forwarding loops.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::sdp;

/// Whether candidate gathering finished before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringOutcome {
    /// Every candidate was gathered and embedded in the description.
    Complete,
    /// The deadline elapsed; the description carries a partial set.
    PartialOnTimeout,
}

/// Shared slot holding the control channel once it is open.
pub(crate) type ControlSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Event streams produced by a negotiated session.
#[derive(Debug)]
pub struct PeerSessionEvents {
    /// Remote audio tracks as they arrive.
    pub inbound_tracks: mpsc::Receiver<Arc<TrackRemote>>,
    /// Fires once per control channel transitioning to open.
    pub control_open: mpsc::Receiver<Arc<RTCDataChannel>>,
    /// Raw text payloads received on the control channel.
    pub control_messages: mpsc::Receiver<String>,
}

pub(crate) struct EventSenders {
    pub track_tx: mpsc::Sender<Arc<TrackRemote>>,
    pub open_tx: mpsc::Sender<Arc<RTCDataChannel>>,
    pub message_tx: mpsc::Sender<String>,
}

pub(crate) fn event_channels() -> (EventSenders, PeerSessionEvents) {
    let (track_tx, inbound_tracks) = mpsc::channel(8);
    let (open_tx, control_open) = mpsc::channel(8);
    let (message_tx, control_messages) = mpsc::channel(64);
    (
        EventSenders {
            track_tx,
            open_tx,
            message_tx,
        },
        PeerSessionEvents {
            inbound_tracks,
            control_open,
            control_messages,
        },
    )
}

/// A negotiated WebRTC session.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    outbound: Arc<TrackLocalStaticSample>,
    control: ControlSlot,
    gathering: GatheringOutcome,
    local_sdp: String,
}

impl PeerSession {
    pub(crate) fn new(
        pc: Arc<RTCPeerConnection>,
        outbound: Arc<TrackLocalStaticSample>,
        control: ControlSlot,
        gathering: GatheringOutcome,
        local_sdp: String,
    ) -> Self {
        Self {
            pc,
            outbound,
            control,
            gathering,
            local_sdp,
        }
    }

    /// The local description produced during negotiation.
    pub fn local_sdp(&self) -> &str {
        &self.local_sdp
    }

    /// Whether gathering completed before the deadline.
    pub fn gathering(&self) -> GatheringOutcome {
        self.gathering
    }

    /// The outbound audio track. Write encoded Opus samples here.
    pub fn outbound_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.outbound)
    }

    /// Write one encoded audio sample to the outbound track.
    pub async fn write_audio(&self, sample: &Sample) -> Result<()> {
        self.outbound.write_sample(sample).await?;
        Ok(())
    }

    /// Apply the remote answer after an outbound offer.
    pub async fn accept_answer(&self, answer_sdp: &str) -> Result<()> {
        sdp::validate_remote_description(answer_sdp)?;
        let answer =
            webrtc::peer_connection::sdp::session_description::RTCSessionDescription::answer(
                answer_sdp.to_string(),
            )?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Whether the control channel is currently open.
    pub async fn control_is_open(&self) -> bool {
        self.control.read().await.is_some()
    }

    /// Send a text payload over the control channel.
    pub async fn send_control_text(&self, text: &str) -> Result<()> {
        let channel = {
            let guard = self.control.read().await;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| Error::ControlChannel("channel not open".to_string()))?
        };
        channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::ControlChannel(e.to_string()))?;
        Ok(())
    }

    /// Whether the underlying peer connection reached the connected state.
    pub fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// Tear down the peer connection.
    pub async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("gathering", &self.gathering)
            .field("state", &self.pc.connection_state())
            .finish()
    }
}

/// Install track and data-channel handlers on a fresh peer connection.
pub(crate) fn wire_peer_handlers(
    pc: &Arc<RTCPeerConnection>,
    control: ControlSlot,
    senders: &EventSenders,
) {
    let track_tx = senders.track_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let track_tx = track_tx.clone();
        Box::pin(async move {
            debug!(
                ssrc = track.ssrc(),
                codec = %track.codec().capability.mime_type,
                "Remote track arrived"
            );
            if track_tx.send(track).await.is_err() {
                warn!("Inbound track receiver dropped, ignoring remote track");
            }
        })
    }));

    let open_tx = senders.open_tx.clone();
    let message_tx = senders.message_tx.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let control = Arc::clone(&control);
        let open_tx = open_tx.clone();
        let message_tx = message_tx.clone();
        Box::pin(async move {
            debug!(label = %dc.label(), "Remote control channel announced");
            wire_control_channel(&dc, control, open_tx, message_tx);
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state| {
        debug!(%state, "Peer connection state changed");
        Box::pin(async {})
    }));
}

/// Install open/message handlers on a control channel, whether locally
/// created or announced by the peer.
pub(crate) fn wire_control_channel(
    dc: &Arc<RTCDataChannel>,
    control: ControlSlot,
    open_tx: mpsc::Sender<Arc<RTCDataChannel>>,
    message_tx: mpsc::Sender<String>,
) {
    let dc_for_open = Arc::clone(dc);
    dc.on_open(Box::new(move || {
        let control = Arc::clone(&control);
        let dc = Arc::clone(&dc_for_open);
        let open_tx = open_tx.clone();
        Box::pin(async move {
            debug!(label = %dc.label(), "Control channel open");
            *control.write().await = Some(Arc::clone(&dc));
            let _ = open_tx.send(dc).await;
        })
    }));

    dc.on_message(Box::new(move |msg| {
        let message_tx = message_tx.clone();
        Box::pin(async move {
            if !msg.is_string {
                warn!("Dropping non-text control payload ({} bytes)", msg.data.len());
                return;
            }
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            // Payloads are forwarded opaquely. Only the type tag is
            // inspected, for log correlation.
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => debug!(
                    message_type = value
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown"),
                    "Control message received"
                ),
                Err(_) => debug!("Control message received (non-JSON)"),
            }
            if message_tx.send(text).await.is_err() {
                warn!("Control message receiver dropped");
            }
        })
    }));
}
