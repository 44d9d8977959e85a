//! Common infrastructure for the voicebridge stack.
//!
//! This crate provides the pieces every other voicebridge crate leans on:
//! the typed event bus with its publish middleware layers, logging setup,
//! and shared infrastructure error types.

pub mod errors;
pub mod events;
pub mod logging;

pub use errors::{Error, Result};
pub use events::bus::{EventBus, EventBusConfig, PublishOutcome, SubscriptionId};
pub use events::layers::{
    DedupLayer, LayerVerdict, LoggingLayer, PublishLayer, RateLimitLayer, ValidationLayer,
};
pub use events::types::{BridgeEvent, EventError, EventTopic};

/// Re-export of the most commonly used types.
pub mod prelude {
    pub use super::events::bus::{EventBus, EventBusConfig, PublishOutcome, SubscriptionId};
    pub use super::events::types::{BridgeEvent, EventError, EventTopic};
    pub use super::logging::{setup_logging, LoggingConfig};
}
