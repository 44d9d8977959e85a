//! Core session types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one bridged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Who initiated the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The telephony peer called us.
    Inbound,
    /// We dialed out toward the telephony peer.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Why a connection was terminated. Threaded through the termination
/// event and consulted for the farewell message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    /// The maximum call duration elapsed.
    Timeout,
    /// The caller stayed silent past the retry budget.
    Silence,
    /// Ordinary hangup or explicit shutdown.
    Default,
}

impl TerminationReason {
    /// Stable string form carried in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Silence => "silence",
            Self::Default => "default",
        }
    }

    /// Parse the event payload form. Unknown strings map to `Default`.
    pub fn from_reason_str(s: &str) -> Self {
        match s {
            "timeout" => Self::Timeout,
            "silence" => Self::Silence,
            _ => Self::Default,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_round_trips_through_string() {
        let id = ConnectionId::new();
        let parsed: ConnectionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn termination_reason_strings() {
        assert_eq!(TerminationReason::Timeout.as_str(), "timeout");
        assert_eq!(
            TerminationReason::from_reason_str("silence"),
            TerminationReason::Silence
        );
        assert_eq!(
            TerminationReason::from_reason_str("surprise"),
            TerminationReason::Default
        );
    }
}
