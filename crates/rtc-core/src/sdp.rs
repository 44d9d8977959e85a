//! Pure SDP inspection helpers.
//!
//! The negotiator makes a handful of decisions by looking at the raw
//! session description before handing it to the WebRTC stack: whether
//! the peer only published relay candidates, how many application media
//! sections it declared, and whether the description is structurally
//! sound at all. These checks are plain string scans so they stay
//! testable without a peer connection.

use crate::error::{Error, Result};

/// Transport restriction derived from the remote peer's candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    /// Use every candidate type the ICE agent can gather.
    All,
    /// Restrict the local agent to relay candidates.
    RelayOnly,
}

/// Structural sanity check for a remote description.
///
/// Rejects descriptions missing the version line or an audio section
/// before they reach the peer connection, where failures surface as
/// opaque negotiation errors.
pub fn validate_remote_description(sdp: &str) -> Result<()> {
    if !sdp.starts_with("v=0") {
        return Err(Error::MalformedSdp("missing v=0 version line".to_string()));
    }
    if !lines(sdp).any(|l| l.starts_with("m=audio")) {
        return Err(Error::MalformedSdp("no audio media section".to_string()));
    }
    Ok(())
}

/// Number of `m=application` sections in a description.
///
/// The local description must declare the same number, because
/// asymmetric channel counts break some peers' media pipelines.
pub fn application_media_count(sdp: &str) -> usize {
    lines(sdp).filter(|l| l.starts_with("m=application")).count()
}

/// Whether every published candidate is a relay candidate.
///
/// Returns `false` when the description carries no candidates at all,
/// since trickled candidates may still include host or reflexive ones.
pub fn is_relay_only(sdp: &str) -> bool {
    let mut saw_candidate = false;
    for line in lines(sdp) {
        if let Some(rest) = line.strip_prefix("a=candidate:") {
            saw_candidate = true;
            if candidate_type(rest) != Some("relay") {
                return false;
            }
        }
    }
    saw_candidate
}

/// Determine the local transport policy for answering `offer`.
///
/// A peer that only published relay candidates cannot reach host or
/// reflexive candidates of ours, so mirror the restriction. Anything
/// else leaves the agent unrestricted.
pub fn transport_policy_for_offer(offer: &str) -> TransportPolicy {
    if is_relay_only(offer) {
        TransportPolicy::RelayOnly
    } else {
        TransportPolicy::All
    }
}

fn lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.lines().map(str::trim_end)
}

// Candidate grammar: foundation component transport priority addr port "typ" type ...
fn candidate_type(candidate: &str) -> Option<&str> {
    let mut fields = candidate.split_whitespace();
    while let Some(field) = fields.next() {
        if field == "typ" {
            return fields.next();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

    fn offer(extra: &str) -> String {
        format!("{BASE}m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n{extra}")
    }

    #[test]
    fn validates_audio_section() {
        assert!(validate_remote_description(&offer("")).is_ok());
        assert!(validate_remote_description("v=0\r\ns=-\r\n").is_err());
        assert!(validate_remote_description("o=- 1 1 IN IP4 0.0.0.0\r\n").is_err());
    }

    #[test]
    fn counts_application_sections() {
        assert_eq!(application_media_count(&offer("")), 0);
        let with_dc = offer("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        assert_eq!(application_media_count(&with_dc), 1);
    }

    #[test]
    fn relay_only_offer_restricts_policy() {
        let relay = offer("a=candidate:1 1 udp 16777215 198.51.100.4 50000 typ relay raddr 0.0.0.0 rport 0\r\n");
        assert!(is_relay_only(&relay));
        assert_eq!(transport_policy_for_offer(&relay), TransportPolicy::RelayOnly);
    }

    #[test]
    fn host_candidate_leaves_policy_unrestricted() {
        let mixed = offer(
            "a=candidate:1 1 udp 16777215 198.51.100.4 50000 typ relay raddr 0.0.0.0 rport 0\r\n\
             a=candidate:2 1 udp 2130706431 192.0.2.10 50001 typ host\r\n",
        );
        assert!(!is_relay_only(&mixed));
        assert_eq!(transport_policy_for_offer(&mixed), TransportPolicy::All);
    }

    #[test]
    fn no_candidates_means_unrestricted() {
        assert!(!is_relay_only(&offer("")));
        assert_eq!(transport_policy_for_offer(&offer("")), TransportPolicy::All);
    }
}
