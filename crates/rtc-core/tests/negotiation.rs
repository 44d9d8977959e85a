//! Offer/answer integration tests against a real peer connection.

use std::sync::Arc;

use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use voicebridge_rtc_core::sdp;
use voicebridge_rtc_core::{NegotiatorConfig, SessionNegotiator};

/// Build a remote peer the way a browser or gateway would: default
/// codecs, one control channel, one audio section.
async fn remote_peer_with_offer() -> (Arc<RTCPeerConnection>, String) {
    let mut media = MediaEngine::default();
    media.register_default_codecs().expect("codec registration");
    let api = APIBuilder::new().with_media_engine(media).build();
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .expect("peer connection"),
    );

    pc.create_data_channel("events", None)
        .await
        .expect("data channel");
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
        .await
        .expect("audio transceiver");

    let offer = pc.create_offer(None).await.expect("offer");
    let mut gather_done = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.expect("local description");
    let _ = gather_done.recv().await;

    let sdp = pc
        .local_description()
        .await
        .expect("gathered description")
        .sdp;
    (pc, sdp)
}

#[tokio::test]
async fn answer_mirrors_control_channel_and_restricts_codecs() {
    let (remote, offer_sdp) = remote_peer_with_offer().await;
    assert_eq!(sdp::application_media_count(&offer_sdp), 1);

    let negotiator = SessionNegotiator::new(NegotiatorConfig::default());
    let (session, _events) = negotiator.answer(&offer_sdp).await.expect("answer");
    let answer_sdp = session.local_sdp().to_string();

    // One application section in, one out.
    assert_eq!(sdp::application_media_count(&answer_sdp), 1);

    // Only Opus survives codec negotiation.
    let rtpmaps: Vec<&str> = answer_sdp
        .lines()
        .filter(|l| l.starts_with("a=rtpmap:"))
        .collect();
    assert!(!rtpmaps.is_empty());
    assert!(rtpmaps.iter().all(|l| l.contains("opus/48000")));

    // The answering side accepts the DTLS handshake.
    assert!(answer_sdp.lines().any(|l| l == "a=setup:passive"));

    // The remote peer accepts our answer without complaint.
    let answer = RTCSessionDescription::answer(answer_sdp).expect("parse answer");
    remote
        .set_remote_description(answer)
        .await
        .expect("remote accepts answer");

    session.close().await.expect("close");
    remote.close().await.expect("close remote");
}

#[tokio::test]
async fn offer_carries_audio_and_one_control_channel() {
    let negotiator = SessionNegotiator::new(
        NegotiatorConfig::default().with_control_channel_label("model-events"),
    );
    let (session, _events) = negotiator.offer().await.expect("offer");
    let offer_sdp = session.local_sdp();

    assert!(offer_sdp.starts_with("v=0"));
    assert!(offer_sdp.lines().any(|l| l.starts_with("m=audio")));
    assert_eq!(sdp::application_media_count(offer_sdp), 1);

    session.close().await.expect("close");
}

#[tokio::test]
async fn relay_only_offer_gets_a_relay_restricted_answer() {
    let (remote, offer_sdp) = remote_peer_with_offer().await;
    remote.close().await.expect("close remote");

    // Rewrite the gathered candidates into a single relay candidate,
    // the shape a TURN-forced gateway produces.
    let mut kept_relay = false;
    let relay_offer = offer_sdp
        .lines()
        .filter_map(|line| {
            if line.starts_with("a=candidate:") {
                if kept_relay {
                    None
                } else {
                    kept_relay = true;
                    Some(
                        "a=candidate:1 1 udp 16777215 198.51.100.4 50000 typ relay \
                         raddr 198.51.100.4 rport 50000",
                    )
                }
            } else {
                Some(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
        + "\r\n";
    assert!(kept_relay);
    assert!(sdp::is_relay_only(&relay_offer));

    let negotiator = SessionNegotiator::new(
        NegotiatorConfig::default().with_gather_timeout(std::time::Duration::from_secs(1)),
    );
    let (session, _events) = negotiator.answer(&relay_offer).await.expect("answer");
    let answer_sdp = session.local_sdp().to_string();

    // Relay policy with no TURN server configured leaves nothing to
    // gather: host and srflx candidates must not appear.
    assert!(
        !answer_sdp.lines().any(|l| l.starts_with("a=candidate:")),
        "relay-restricted answer leaked candidates:\n{answer_sdp}"
    );
    assert_eq!(sdp::application_media_count(&answer_sdp), 1);
    assert!(answer_sdp.lines().any(|l| l.starts_with("m=audio")));

    session.close().await.expect("close");
}

#[tokio::test]
async fn rejects_descriptions_without_audio() {
    let negotiator = SessionNegotiator::new(NegotiatorConfig::default());
    let err = negotiator
        .answer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n")
        .await
        .expect_err("offer without audio must fail");
    assert!(err.to_string().contains("audio"));
}
