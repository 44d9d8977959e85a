//! Connection lifecycle and call orchestration for the voicebridge stack.
//!
//! This crate owns everything above the media and transport layers:
//! the connection registry, the monotonic lifecycle state machine with
//! its named readiness dependencies, the silence and max-duration
//! timers, the delegate traits at the AI-backend seam, and the
//! [`CallOrchestrator`] that wires a negotiated transport leg and a
//! model leg into bidirectional forwarding tasks.
//!
//! A typical inbound call:
//!
//! ```text
//! accept_call(offer)  -> answer SDP back to the telephony peer
//! connect_model_leg() -> offer SDP to the model endpoint
//! complete_model_leg(answer)
//! ... readiness events satisfy the dependency set, timers arm,
//!     the greeting goes out, audio flows both ways ...
//! terminate(reason)   -> farewell, grace, teardown (idempotent)
//! ```

pub mod config;
pub mod coordinator;
pub mod delegate;
pub mod errors;
pub mod lifecycle;
pub mod media_adapter;
pub mod registry;
pub mod timers;
pub mod types;

pub use config::BridgeConfig;
pub use coordinator::{AcceptedCall, CallOrchestrator, DialedCall};
pub use delegate::{CallBridgeDelegate, ModelSession, NoToolCalls, PeerModelSession, ToolCallGate};
pub use errors::{Result, SessionError};
pub use lifecycle::{deps, ConnectionPhase, ConnectionState, LifecycleManager};
pub use registry::{Connection, ConnectionRegistry, RegistryStatsSnapshot};
pub use timers::{SilenceCommand, SilenceTimerHandle, TimerCoordinator};
pub use types::{ConnectionId, Direction, TerminationReason};
