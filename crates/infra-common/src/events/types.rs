//! Event and topic types shared across the stack.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topics published on the bridge event bus.
///
/// The readiness topics map one-to-one onto the lifecycle dependencies a
/// connection must satisfy before it is promoted to Ready.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// A connection was registered with the lifecycle manager
    ConnectionCreated,
    /// All readiness dependencies for a connection are satisfied
    ConnectionReady,
    /// A connection was terminated
    ConnectionTerminated,
    /// The telephony leg's audio transport is open
    TransportAudioReady,
    /// The telephony leg's SDP exchange completed
    TransportSdpReady,
    /// The model leg's peer connection is established
    ModelConnectionReady,
    /// The model leg's first audio frame arrived
    ModelAudioReady,
    /// The model leg's control channel is open
    ModelControlChannelReady,
    /// The remote (telephony) leg's first audio frame arrived
    RemoteAudioReady,
    /// The remote party accepted the call
    RemoteCallAccepted,
    /// Real audio was forwarded on a leg
    AudioActivity,
    /// The model started speaking
    ModelSpeechStarted,
    /// The model stopped speaking
    ModelSpeechStopped,
    /// The user's speech onset was detected
    UserSpeechStarted,
    /// The silence timer requests an inactivity prompt
    InactivityPrompt,
    /// A timer or policy requests call termination
    TerminationRequested,
    /// Application-defined topic
    Custom(String),
}

impl EventTopic {
    /// Stable string form used for logging and dedup keys.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionCreated => "connection-created",
            Self::ConnectionReady => "connection-ready",
            Self::ConnectionTerminated => "connection-terminated",
            Self::TransportAudioReady => "transport-audio-ready",
            Self::TransportSdpReady => "transport-sdp-ready",
            Self::ModelConnectionReady => "model-connection-ready",
            Self::ModelAudioReady => "model-audio-ready",
            Self::ModelControlChannelReady => "model-control-channel-ready",
            Self::RemoteAudioReady => "remote-audio-ready",
            Self::RemoteCallAccepted => "remote-call-accepted",
            Self::AudioActivity => "audio-activity",
            Self::ModelSpeechStarted => "model-speech-started",
            Self::ModelSpeechStopped => "model-speech-stopped",
            Self::UserSpeechStarted => "user-speech-started",
            Self::InactivityPrompt => "inactivity-prompt",
            Self::TerminationRequested => "termination-requested",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event dispatched on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Topic the event is published under
    pub topic: EventTopic,
    /// Connection this event concerns, if any
    pub connection_id: Option<String>,
    /// Structured payload; empty object when the topic carries no data
    pub payload: serde_json::Value,
    /// Publish time, unix milliseconds
    pub timestamp_ms: u64,
}

impl BridgeEvent {
    /// Create an event with no connection association and an empty payload.
    pub fn new(topic: EventTopic) -> Self {
        Self {
            topic,
            connection_id: None,
            payload: serde_json::json!({}),
            timestamp_ms: unix_millis(),
        }
    }

    /// Create an event tied to a connection.
    pub fn for_connection(topic: EventTopic, connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::new(topic)
        }
    }

    /// Attach a structured payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors raised by the event system.
#[derive(Debug, Error)]
pub enum EventError {
    /// Waited for an event that never fired
    #[error("timed out after {0:?} waiting for event")]
    Timeout(std::time::Duration),

    /// Internal channel failure
    #[error("event channel error: {0}")]
    ChannelError(String),

    /// Event rejected by a publish layer
    #[error("event dropped by {layer} layer: {reason}")]
    Rejected {
        /// Name of the rejecting layer
        layer: &'static str,
        /// Human-readable reason
        reason: String,
    },
}

/// Result alias for event operations.
pub type EventResult<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_string_forms_are_stable() {
        assert_eq!(EventTopic::TransportAudioReady.as_str(), "transport-audio-ready");
        assert_eq!(EventTopic::Custom("x".into()).as_str(), "x");
        assert_eq!(EventTopic::TerminationRequested.to_string(), "termination-requested");
    }

    #[test]
    fn event_payload_access() {
        let ev = BridgeEvent::for_connection(EventTopic::TerminationRequested, "conn-1")
            .with_payload(serde_json::json!({ "reason": "silence" }));
        assert_eq!(ev.connection_id.as_deref(), Some("conn-1"));
        assert_eq!(ev.payload_str("reason"), Some("silence"));
        assert_eq!(ev.payload_str("missing"), None);
    }
}
