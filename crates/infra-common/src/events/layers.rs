//! Publish middleware layers.
//!
//! Each layer inspects an event before dispatch and either forwards it or
//! drops it. Layers run in the order they were installed on the bus;
//! handler-side containment (panic recovery, per-handler timeout) lives in
//! the dispatcher itself, not here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::types::{BridgeEvent, EventTopic};

/// Decision returned by a publish layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerVerdict {
    /// Pass the event to the next layer (and eventually to handlers)
    Forward,
    /// Drop the event with a reason
    Drop(String),
}

/// A composable pre-dispatch check applied to every published event.
#[async_trait]
pub trait PublishLayer: Send + Sync {
    /// Short layer name used in logs and rejection errors.
    fn name(&self) -> &'static str;

    /// Inspect the event and decide whether dispatch continues.
    async fn check(&self, event: &BridgeEvent) -> LayerVerdict;
}

/// Logs every published event at debug level. Always forwards.
pub struct LoggingLayer;

#[async_trait]
impl PublishLayer for LoggingLayer {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn check(&self, event: &BridgeEvent) -> LayerVerdict {
        debug!(
            topic = %event.topic,
            connection = event.connection_id.as_deref().unwrap_or("-"),
            "publishing event"
        );
        LayerVerdict::Forward
    }
}

/// Rejects events whose payloads are malformed for their topic.
///
/// Only topics with a known payload contract are checked; everything else
/// forwards untouched.
pub struct ValidationLayer;

#[async_trait]
impl PublishLayer for ValidationLayer {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn check(&self, event: &BridgeEvent) -> LayerVerdict {
        match &event.topic {
            EventTopic::TerminationRequested => {
                match event.payload_str("reason") {
                    Some("timeout") | Some("silence") | Some("default") => LayerVerdict::Forward,
                    Some(other) => {
                        LayerVerdict::Drop(format!("unknown termination reason {:?}", other))
                    }
                    None => LayerVerdict::Drop("termination event missing reason".to_string()),
                }
            }
            EventTopic::InactivityPrompt => {
                if event.connection_id.is_none() {
                    LayerVerdict::Drop("inactivity prompt without connection id".to_string())
                } else {
                    LayerVerdict::Forward
                }
            }
            _ => LayerVerdict::Forward,
        }
    }
}

/// Suppresses repeated identical `(topic, connection)` events inside a
/// sliding window.
pub struct DedupLayer {
    window: Duration,
    seen: Mutex<HashMap<(String, String), Instant>>,
}

impl DedupLayer {
    /// Create a dedup layer with the given sliding window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    // Only state announcements are dedup candidates: a readiness or
    // lifecycle report repeated inside the window carries no new
    // information. Speech activity and prompts legitimately recur.
    fn deduplicable(topic: &EventTopic) -> bool {
        matches!(
            topic,
            EventTopic::ConnectionCreated
                | EventTopic::ConnectionReady
                | EventTopic::ConnectionTerminated
                | EventTopic::TransportAudioReady
                | EventTopic::TransportSdpReady
                | EventTopic::ModelConnectionReady
                | EventTopic::ModelAudioReady
                | EventTopic::ModelControlChannelReady
                | EventTopic::RemoteAudioReady
                | EventTopic::RemoteCallAccepted
                | EventTopic::TerminationRequested
        )
    }

    fn key(event: &BridgeEvent) -> Option<(String, String)> {
        if !Self::deduplicable(&event.topic) {
            return None;
        }
        event
            .connection_id
            .as_ref()
            .map(|conn| (event.topic.as_str().to_string(), conn.clone()))
    }
}

#[async_trait]
impl PublishLayer for DedupLayer {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn check(&self, event: &BridgeEvent) -> LayerVerdict {
        // Events with no connection association are never deduplicated.
        let Some(key) = Self::key(event) else {
            return LayerVerdict::Forward;
        };

        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Opportunistic prune so the map can't grow without bound.
        if seen.len() > 1024 {
            let window = self.window;
            seen.retain(|_, last| now.duration_since(*last) < window);
        }

        match seen.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => {
                LayerVerdict::Drop(format!("duplicate within {:?}", self.window))
            }
            _ => {
                seen.insert(key, now);
                LayerVerdict::Forward
            }
        }
    }
}

impl Default for DedupLayer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Token-bucket rate limiter over the whole bus.
pub struct RateLimitLayer {
    events_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitLayer {
    /// Create a rate limiter allowing `events_per_sec` sustained with the
    /// given burst capacity.
    pub fn new(events_per_sec: u32, burst: u32) -> Self {
        Self {
            events_per_sec: events_per_sec as f64,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }
}

#[async_trait]
impl PublishLayer for RateLimitLayer {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn check(&self, event: &BridgeEvent) -> LayerVerdict {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.events_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            LayerVerdict::Forward
        } else {
            warn!(topic = %event.topic, "event bus rate limit exceeded");
            LayerVerdict::Drop("rate limit exceeded".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn termination(conn: &str, reason: &str) -> BridgeEvent {
        BridgeEvent::for_connection(EventTopic::TerminationRequested, conn)
            .with_payload(serde_json::json!({ "reason": reason }))
    }

    #[tokio::test]
    async fn validation_accepts_known_reasons() {
        let layer = ValidationLayer;
        assert_eq!(layer.check(&termination("c1", "silence")).await, LayerVerdict::Forward);
        assert_eq!(layer.check(&termination("c1", "timeout")).await, LayerVerdict::Forward);
    }

    #[tokio::test]
    async fn validation_rejects_missing_reason() {
        let layer = ValidationLayer;
        let event = BridgeEvent::for_connection(EventTopic::TerminationRequested, "c1");
        assert!(matches!(layer.check(&event).await, LayerVerdict::Drop(_)));
    }

    #[tokio::test]
    async fn dedup_suppresses_inside_window() {
        let layer = DedupLayer::new(Duration::from_secs(5));
        let event = BridgeEvent::for_connection(EventTopic::RemoteAudioReady, "c1");

        assert_eq!(layer.check(&event).await, LayerVerdict::Forward);
        assert!(matches!(layer.check(&event).await, LayerVerdict::Drop(_)));

        // A different connection is an independent key.
        let other = BridgeEvent::for_connection(EventTopic::RemoteAudioReady, "c2");
        assert_eq!(layer.check(&other).await, LayerVerdict::Forward);
    }

    #[tokio::test]
    async fn dedup_leaves_speech_activity_alone() {
        let layer = DedupLayer::new(Duration::from_secs(5));
        let event = BridgeEvent::for_connection(EventTopic::ModelSpeechStopped, "c1");

        // Back-to-back utterances inside the window must all pass.
        assert_eq!(layer.check(&event).await, LayerVerdict::Forward);
        assert_eq!(layer.check(&event).await, LayerVerdict::Forward);
    }

    #[tokio::test]
    async fn dedup_ignores_events_without_connection() {
        let layer = DedupLayer::new(Duration::from_secs(5));
        let event = BridgeEvent::new(EventTopic::Custom("tick".into()));
        assert_eq!(layer.check(&event).await, LayerVerdict::Forward);
        assert_eq!(layer.check(&event).await, LayerVerdict::Forward);
    }

    #[tokio::test]
    async fn rate_limit_exhausts_burst() {
        let layer = RateLimitLayer::new(1, 3);
        let event = BridgeEvent::new(EventTopic::AudioActivity);

        for _ in 0..3 {
            assert_eq!(layer.check(&event).await, LayerVerdict::Forward);
        }
        assert!(matches!(layer.check(&event).await, LayerVerdict::Drop(_)));
    }
}
