//! Negotiator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single STUN/TURN server entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs, e.g. `turn:relay.example.net:3478?transport=udp`.
    pub urls: Vec<String>,
    /// Long-term credential username. Empty for STUN.
    #[serde(default)]
    pub username: String,
    /// Long-term credential password. Empty for STUN.
    #[serde(default)]
    pub credential: String,
}

/// Configuration for [`crate::SessionNegotiator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiatorConfig {
    /// STUN/TURN servers offered to the ICE agent.
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// Target Opus bitrate in bits per second, advertised through the
    /// `maxaveragebitrate` fmtp parameter. `None` leaves it to the peer.
    #[serde(default)]
    pub opus_bitrate: Option<u32>,

    /// Upper bound on the wait for ICE candidate gathering before the
    /// local description is returned with whatever has gathered so far.
    #[serde(default = "default_gather_timeout", with = "duration_secs")]
    pub gather_timeout: Duration,

    /// Label used when this side creates the control channel.
    #[serde(default = "default_control_label")]
    pub control_channel_label: String,
}

fn default_gather_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_control_label() -> String {
    "events".to_string()
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            opus_bitrate: None,
            gather_timeout: default_gather_timeout(),
            control_channel_label: default_control_label(),
        }
    }
}

impl NegotiatorConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a STUN/TURN server.
    pub fn with_ice_server(mut self, server: IceServerConfig) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Set the Opus bitrate hint.
    pub fn with_opus_bitrate(mut self, bitrate: u32) -> Self {
        self.opus_bitrate = Some(bitrate);
        self
    }

    /// Set the candidate gathering timeout.
    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    /// Set the control channel label used on the offering side.
    pub fn with_control_channel_label(mut self, label: impl Into<String>) -> Self {
        self.control_channel_label = label.into();
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
