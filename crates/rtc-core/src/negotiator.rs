//! SDP offer/answer negotiation.
//!
//! [`SessionNegotiator`] builds Opus-only peer connections and runs both
//! directions of the exchange. On the answering path the DTLS role is
//! forced to server so the telephony gateway always initiates the
//! handshake, the transport policy mirrors the remote candidate set,
//! and no local control channel is created when the peer already
//! offered one. Candidate gathering waits up to a bounded deadline and
//! then returns the description with whatever gathered so far.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::NegotiatorConfig;
use crate::error::{Error, Result};
use crate::peer::{
    event_channels, wire_control_channel, wire_peer_handlers, ControlSlot, GatheringOutcome,
    PeerSession, PeerSessionEvents,
};
use crate::sdp::{self, TransportPolicy};

/// RTP payload type advertised for Opus.
const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Builds and negotiates Opus-only peer sessions.
#[derive(Debug, Clone)]
pub struct SessionNegotiator {
    config: NegotiatorConfig,
}

impl SessionNegotiator {
    /// Create a negotiator with the given configuration.
    pub fn new(config: NegotiatorConfig) -> Self {
        Self { config }
    }

    /// Answer a remote offer.
    ///
    /// Validates the description, mirrors its transport restrictions,
    /// and produces a local answer whose control-channel layout matches
    /// the offer.
    pub async fn answer(&self, remote_offer: &str) -> Result<(PeerSession, PeerSessionEvents)> {
        sdp::validate_remote_description(remote_offer)?;
        let policy = sdp::transport_policy_for_offer(remote_offer);
        let offered_channels = sdp::application_media_count(remote_offer);
        if offered_channels == 0 {
            debug!("Offer carries no control channel");
        }
        info!(?policy, offered_channels, "Answering remote offer");

        let api = self.build_api(true)?;
        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration(policy)).await?);
        let control: ControlSlot = Arc::new(RwLock::new(None));
        let (senders, events) = event_channels();
        wire_peer_handlers(&pc, Arc::clone(&control), &senders);

        // The remote channel is adopted via on_data_channel, so no
        // local channel is created here. Asymmetric channel counts
        // break some peers' media pipelines.
        let track = outbound_opus_track();
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let offer = RTCSessionDescription::offer(remote_offer.to_string())?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        let gathering = self.set_local_and_gather(&pc, answer).await?;

        let local_sdp = local_description(&pc).await?;
        let answered_channels = sdp::application_media_count(&local_sdp);
        if answered_channels != offered_channels {
            warn!(
                offered_channels,
                answered_channels, "Answer does not mirror offered control channels"
            );
        }

        Ok((
            PeerSession::new(pc, track, control, gathering, local_sdp),
            events,
        ))
    }

    /// Produce a local offer with one control channel and one audio track.
    ///
    /// The remote answer is applied later via
    /// [`PeerSession::accept_answer`].
    pub async fn offer(&self) -> Result<(PeerSession, PeerSessionEvents)> {
        let api = self.build_api(false)?;
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration(TransportPolicy::All))
                .await?,
        );
        let control: ControlSlot = Arc::new(RwLock::new(None));
        let (senders, events) = event_channels();
        wire_peer_handlers(&pc, Arc::clone(&control), &senders);

        let dc = pc
            .create_data_channel(&self.config.control_channel_label, None)
            .await?;
        wire_control_channel(
            &dc,
            Arc::clone(&control),
            senders.open_tx.clone(),
            senders.message_tx.clone(),
        );

        let track = outbound_opus_track();
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let offer = pc.create_offer(None).await?;
        let gathering = self.set_local_and_gather(&pc, offer).await?;
        let local_sdp = local_description(&pc).await?;
        info!(?gathering, "Local offer ready");

        Ok((
            PeerSession::new(pc, track, control, gathering, local_sdp),
            events,
        ))
    }

    fn build_api(&self, force_dtls_server: bool) -> Result<API> {
        let mut media = MediaEngine::default();
        media.register_codec(self.opus_parameters(), RTPCodecType::Audio)?;

        let mut setting = SettingEngine::default();
        if force_dtls_server {
            // The answering side must accept the handshake, not
            // initiate it. Gateways reject actpass answers.
            setting.set_answering_dtls_role(DTLSRole::Server)?;
        }

        Ok(APIBuilder::new()
            .with_media_engine(media)
            .with_setting_engine(setting)
            .build())
    }

    fn opus_parameters(&self) -> RTCRtpCodecParameters {
        let mut fmtp = "minptime=10;useinbandfec=1".to_string();
        if let Some(bitrate) = self.config.opus_bitrate {
            fmtp.push_str(&format!(";maxaveragebitrate={bitrate}"));
        }
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: fmtp,
                rtcp_feedback: vec![],
            },
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        }
    }

    fn rtc_configuration(&self, policy: TransportPolicy) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: match policy {
                TransportPolicy::All => RTCIceTransportPolicy::All,
                TransportPolicy::RelayOnly => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        }
    }

    async fn set_local_and_gather(
        &self,
        pc: &Arc<RTCPeerConnection>,
        desc: RTCSessionDescription,
    ) -> Result<GatheringOutcome> {
        let mut gather_done = pc.gathering_complete_promise().await;
        pc.set_local_description(desc).await?;
        match tokio::time::timeout(self.config.gather_timeout, gather_done.recv()).await {
            Ok(_) => Ok(GatheringOutcome::Complete),
            Err(_) => {
                warn!(
                    timeout = ?self.config.gather_timeout,
                    "Candidate gathering deadline elapsed, continuing with partial set"
                );
                Ok(GatheringOutcome::PartialOnTimeout)
            }
        }
    }
}

fn outbound_opus_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_string(),
        "voicebridge".to_string(),
    ))
}

async fn local_description(pc: &Arc<RTCPeerConnection>) -> Result<String> {
    pc.local_description()
        .await
        .map(|desc| desc.sdp)
        .ok_or_else(|| Error::Negotiation("no local description available".to_string()))
}
