//! Typed publish/subscribe event system.
//!
//! Readiness milestones, lifecycle transitions, and timer firings all flow
//! through one [`bus::EventBus`]. Dispatch is synchronous on the publishing
//! task: handlers run in subscription order, each wrapped in panic
//! containment and a per-handler timeout so a misbehaving subscriber can
//! never stall or crash the publisher.

pub mod bus;
pub mod layers;
pub mod types;

pub use bus::{EventBus, EventBusConfig, PublishOutcome, SubscriptionId};
pub use layers::{DedupLayer, LayerVerdict, LoggingLayer, PublishLayer, RateLimitLayer, ValidationLayer};
pub use types::{BridgeEvent, EventError, EventTopic};
