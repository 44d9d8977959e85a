//! The bridge event bus.
//!
//! Topic-keyed publish/subscribe with synchronous dispatch: handlers for an
//! event run in subscription order on the publishing task, each wrapped in
//! panic containment and a per-handler timeout. Publish layers (validation,
//! logging, dedup, rate limiting) run before any handler sees the event.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

use super::layers::{DedupLayer, LayerVerdict, LoggingLayer, PublishLayer, RateLimitLayer, ValidationLayer};
use super::types::{BridgeEvent, EventError, EventResult, EventTopic};

/// Boxed future returned by event handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An event handler: takes the published event, returns a future run to
/// completion (or timeout) before the next handler starts.
pub type EventHandler = Arc<dyn Fn(Arc<BridgeEvent>) -> HandlerFuture + Send + Sync>;

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Maximum wall time a single handler may take per event
    pub handler_timeout: Duration,
    /// Sliding window for `(topic, connection)` deduplication
    pub dedup_window: Duration,
    /// Sustained publish rate across the whole bus
    pub rate_limit_per_sec: u32,
    /// Burst capacity of the rate limiter
    pub rate_limit_burst: u32,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(1),
            dedup_window: Duration::from_secs(5),
            rate_limit_per_sec: 200,
            rate_limit_burst: 400,
        }
    }
}

/// Identifier returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionId {
    topic: EventTopic,
    seq: u64,
}

/// Outcome of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Event reached dispatch; carries the number of handlers invoked
    Delivered(usize),
    /// A publish layer dropped the event before dispatch
    Dropped {
        /// Name of the dropping layer
        layer: &'static str,
        /// Human-readable reason
        reason: String,
    },
}

struct Subscription {
    seq: u64,
    handler: EventHandler,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventTopic, Vec<Subscription>>>,
    layers: Vec<Arc<dyn PublishLayer>>,
    handler_timeout: Duration,
    next_seq: AtomicU64,
}

/// Typed publish/subscribe hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default middleware chain:
    /// validation, then logging, then dedup, then rate limiting.
    pub fn new(config: EventBusConfig) -> Self {
        let layers: Vec<Arc<dyn PublishLayer>> = vec![
            Arc::new(ValidationLayer),
            Arc::new(LoggingLayer),
            Arc::new(DedupLayer::new(config.dedup_window)),
            Arc::new(RateLimitLayer::new(config.rate_limit_per_sec, config.rate_limit_burst)),
        ];
        Self::with_layers(config, layers)
    }

    /// Create a bus with an explicit layer chain, in dispatch order.
    pub fn with_layers(config: EventBusConfig, layers: Vec<Arc<dyn PublishLayer>>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                layers,
                handler_timeout: config.handler_timeout,
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Create a bus with default configuration.
    pub fn new_default() -> Self {
        Self::new(EventBusConfig::default())
    }

    /// Register a handler for a topic. Handlers run in subscription order.
    pub async fn subscribe<F>(&self, topic: EventTopic, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<BridgeEvent>) -> HandlerFuture + Send + Sync + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.inner.subscribers.write().await;
        subscribers.entry(topic.clone()).or_default().push(Subscription {
            seq,
            handler: Arc::new(handler),
        });
        SubscriptionId { topic, seq }
    }

    /// Remove a subscription. Removing twice is a no-op.
    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        let mut subscribers = self.inner.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(&id.topic) {
            subs.retain(|s| s.seq != id.seq);
            if subs.is_empty() {
                subscribers.remove(&id.topic);
            }
        }
    }

    /// Publish an event: run the layer chain, then dispatch to the topic's
    /// handlers in subscription order.
    ///
    /// A handler panic or timeout is reported and never propagated to the
    /// publisher or to sibling handlers.
    pub async fn publish(&self, event: BridgeEvent) -> PublishOutcome {
        for layer in &self.inner.layers {
            if let LayerVerdict::Drop(reason) = layer.check(&event).await {
                debug!(topic = %event.topic, layer = layer.name(), %reason, "event dropped");
                return PublishOutcome::Dropped {
                    layer: layer.name(),
                    reason,
                };
            }
        }

        // Snapshot the handler list so dispatch never holds the registry
        // lock across an await.
        let handlers: Vec<EventHandler> = {
            let subscribers = self.inner.subscribers.read().await;
            subscribers
                .get(&event.topic)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };

        let event = Arc::new(event);
        let mut invoked = 0usize;
        for handler in handlers {
            let fut = AssertUnwindSafe(handler(event.clone())).catch_unwind();
            match tokio::time::timeout(self.inner.handler_timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    error!(topic = %event.topic, "event handler panicked: {}", msg);
                }
                Err(_) => {
                    warn!(
                        topic = %event.topic,
                        timeout = ?self.inner.handler_timeout,
                        "event handler timed out"
                    );
                }
            }
            invoked += 1;
        }

        PublishOutcome::Delivered(invoked)
    }

    /// Wait for the next event on a topic, optionally restricted to one
    /// connection, with a deadline.
    ///
    /// The temporary subscription is removed on fire, timeout, or error, so
    /// abandoned waits never leak handlers.
    pub async fn wait_for(
        &self,
        topic: EventTopic,
        connection_id: Option<String>,
        timeout: Duration,
    ) -> EventResult<Arc<BridgeEvent>> {
        let (tx, mut rx) = mpsc::channel::<Arc<BridgeEvent>>(1);

        let filter_conn = connection_id.clone();
        let id = self
            .subscribe(topic, move |event| {
                let tx = tx.clone();
                let filter_conn = filter_conn.clone();
                Box::pin(async move {
                    if let Some(want) = &filter_conn {
                        if event.connection_id.as_deref() != Some(want.as_str()) {
                            return;
                        }
                    }
                    // Full buffer just means the waiter already got its event.
                    let _ = tx.try_send(event);
                })
            })
            .await;

        let result = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(EventError::ChannelError("wait channel closed".to_string())),
            Err(_) => Err(EventError::Timeout(timeout)),
        };

        self.unsubscribe(&id).await;
        result
    }

    /// Number of handlers currently subscribed to a topic.
    pub async fn subscriber_count(&self, topic: &EventTopic) -> usize {
        let subscribers = self.inner.subscribers.read().await;
        subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}
