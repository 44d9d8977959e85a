//! Connection lifecycle tracking.
//!
//! Each connection moves through a monotonic phase sequence: `Created`,
//! `Initializing`, `Ready`, `Terminating`, `Terminated`. Readiness is
//! driven by a set of named dependencies registered up front; when the
//! last one is satisfied the connection flips to `Ready` and a single
//! readiness event is published. Termination is idempotent: exactly one
//! termination event per connection, with bookkeeping removal deferred
//! so handlers still in flight can resolve the id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use voicebridge_infra_common::{BridgeEvent, EventBus, EventTopic};

use crate::errors::{Result, SessionError};
use crate::types::{ConnectionId, TerminationReason};

/// Dependency names a connection may wait on before becoming ready.
pub mod deps {
    /// The telephony-facing audio track is flowing.
    pub const TRANSPORT_AUDIO_READY: &str = "transport-audio-ready";
    /// The telephony-facing SDP exchange completed.
    pub const TRANSPORT_SDP_READY: &str = "transport-sdp-ready";
    /// The model peer connection reached the connected state.
    pub const MODEL_CONNECTION_READY: &str = "model-connection-ready";
    /// The model's audio track arrived.
    pub const MODEL_AUDIO_READY: &str = "model-audio-ready";
    /// The model's control channel is open.
    pub const MODEL_CONTROL_CHANNEL_READY: &str = "model-control-channel-ready";
    /// The remote callee's audio track arrived (outbound calls).
    pub const REMOTE_AUDIO_READY: &str = "remote-audio-ready";
    /// The remote callee accepted the call (outbound calls).
    pub const REMOTE_CALL_ACCEPTED: &str = "remote-call-accepted";
}

/// Phase of a connection. Strictly monotonic; transitions never go back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    /// Registered, dependencies not yet declared satisfied.
    Created,
    /// Waiting on readiness dependencies.
    Initializing,
    /// All dependencies satisfied; media may flow.
    Ready,
    /// Termination in progress.
    Terminating,
    /// Fully torn down; bookkeeping about to be removed.
    Terminated,
}

impl ConnectionPhase {
    /// Stable string form used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Dependency name to satisfied flag.
    pub dependencies: HashMap<String, bool>,
    /// Reason recorded at termination.
    pub termination_reason: Option<TerminationReason>,
}

impl ConnectionState {
    fn new(dependencies: &[&str]) -> Self {
        Self {
            phase: ConnectionPhase::Created,
            dependencies: dependencies
                .iter()
                .map(|name| ((*name).to_string(), false))
                .collect(),
            termination_reason: None,
        }
    }

    fn all_satisfied(&self) -> bool {
        self.dependencies.values().all(|ready| *ready)
    }
}

/// Tracks phases and readiness dependencies for every connection.
pub struct LifecycleManager {
    states: Arc<RwLock<HashMap<ConnectionId, ConnectionState>>>,
    bus: EventBus,
    cleanup_delay: Duration,
}

impl LifecycleManager {
    /// Create a manager publishing onto `bus`, removing terminated
    /// connections after `cleanup_delay`.
    pub fn new(bus: EventBus, cleanup_delay: Duration) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            bus,
            cleanup_delay,
        }
    }

    /// Register a connection with its readiness dependency set.
    ///
    /// Publishes a creation event and moves the connection to
    /// `Initializing`. Registering an existing id is an error.
    pub async fn register_connection(
        &self,
        id: ConnectionId,
        dependencies: &[&str],
    ) -> Result<()> {
        {
            let mut states = self.states.write().await;
            if states.contains_key(&id) {
                return Err(SessionError::AlreadyRegistered(id));
            }
            let mut state = ConnectionState::new(dependencies);
            state.phase = ConnectionPhase::Initializing;
            states.insert(id, state);
        }

        info!(connection = %id, deps = dependencies.len(), "connection registered");
        self.bus
            .publish(BridgeEvent::for_connection(
                EventTopic::ConnectionCreated,
                id.to_string(),
            ))
            .await;
        Ok(())
    }

    /// Mark one named dependency satisfied.
    ///
    /// Unknown names are logged and ignored; readiness must not hinge on
    /// a leg reporting something this call direction never registered.
    /// A no-op once the connection is `Ready` or beyond. Publishes the
    /// readiness event when the last dependency lands.
    pub async fn mark_dependency_ready(&self, id: ConnectionId, name: &str) -> Result<()> {
        let became_ready = {
            let mut states = self.states.write().await;
            let state = states.get_mut(&id).ok_or(SessionError::NotFound(id))?;

            if state.phase >= ConnectionPhase::Ready {
                debug!(connection = %id, dependency = name, phase = %state.phase,
                       "dependency report after readiness, ignoring");
                return Ok(());
            }

            match state.dependencies.get_mut(name) {
                Some(ready) => *ready = true,
                None => {
                    warn!(connection = %id, dependency = name, "unknown dependency, ignoring");
                    return Ok(());
                }
            }

            if state.all_satisfied() {
                state.phase = ConnectionPhase::Ready;
                true
            } else {
                debug!(connection = %id, dependency = name, "dependency satisfied");
                false
            }
        };

        if became_ready {
            info!(connection = %id, "connection ready");
            self.bus
                .publish(BridgeEvent::for_connection(
                    EventTopic::ConnectionReady,
                    id.to_string(),
                ))
                .await;
        }
        Ok(())
    }

    /// Begin termination. Idempotent: only the first call publishes the
    /// termination event and schedules removal; later calls return
    /// `false`.
    ///
    /// The connection stays in `Terminating` for the cleanup delay and
    /// only flips to `Terminated` when its bookkeeping is removed. Event
    /// handlers racing the teardown keep resolving the connection during
    /// that window, and the `Terminating` phase is what makes repeated
    /// termination requests a no-op.
    pub async fn terminate_connection(
        &self,
        id: ConnectionId,
        reason: TerminationReason,
    ) -> Result<bool> {
        {
            let mut states = self.states.write().await;
            let state = states.get_mut(&id).ok_or(SessionError::NotFound(id))?;
            if state.phase >= ConnectionPhase::Terminating {
                debug!(connection = %id, "termination already in progress");
                return Ok(false);
            }
            state.phase = ConnectionPhase::Terminating;
            state.termination_reason = Some(reason);
        }

        info!(connection = %id, %reason, "connection terminating");
        self.bus
            .publish(
                BridgeEvent::for_connection(EventTopic::ConnectionTerminated, id.to_string())
                    .with_payload(serde_json::json!({ "reason": reason.as_str() })),
            )
            .await;

        self.schedule_removal(id);
        Ok(true)
    }

    // Keep the state resolvable for a grace period so handlers racing
    // the teardown still see a known connection.
    fn schedule_removal(&self, id: ConnectionId) {
        let states = Arc::clone(&self.states);
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut states = states.write().await;
            if let Some(state) = states.get_mut(&id) {
                state.phase = ConnectionPhase::Terminated;
            }
            states.remove(&id);
            debug!(connection = %id, "connection bookkeeping removed");
        });
    }

    /// Current phase of a connection.
    pub async fn phase(&self, id: ConnectionId) -> Result<ConnectionPhase> {
        let states = self.states.read().await;
        states
            .get(&id)
            .map(|s| s.phase)
            .ok_or(SessionError::NotFound(id))
    }

    /// Whether a connection reached readiness.
    pub async fn is_ready(&self, id: ConnectionId) -> bool {
        matches!(self.phase(id).await, Ok(ConnectionPhase::Ready))
    }

    /// Reason recorded at termination, if any.
    pub async fn termination_reason(&self, id: ConnectionId) -> Option<TerminationReason> {
        let states = self.states.read().await;
        states.get(&id).and_then(|s| s.termination_reason)
    }
}
