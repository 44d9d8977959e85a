//! Call orchestration.
//!
//! The [`CallOrchestrator`] ties everything together: it negotiates
//! both legs of a call, registers the lifecycle dependency set for the
//! call direction, spawns one forwarding task per inbound stream,
//! starts the per-connection timers when the call becomes ready, and
//! runs the termination sequence exactly once per connection.
//!
//! Event flow is the backbone. Readiness reports, timer expiries and
//! termination requests all travel over the bus, so the pieces stay
//! decoupled and each can be exercised alone in tests.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voicebridge_infra_common::{BridgeEvent, EventBus, EventTopic};
use voicebridge_media_core::{
    AudioCache, BackgroundAudioInjector, BackgroundClip, CodecBridge, OpusAudioCodec, StreamRole,
};
use voicebridge_rtc_core::{PeerSession, PeerSessionEvents, SessionNegotiator};

use crate::config::BridgeConfig;
use crate::delegate::{CallBridgeDelegate, ModelSession, PeerModelSession, ToolCallGate};
use crate::errors::{Result, SessionError};
use crate::lifecycle::{deps, LifecycleManager};
use crate::media_adapter::{LocalTrackSink, ModelAudioSink, RemoteTrackSource};
use crate::registry::{Connection, ConnectionRegistry, RegistryStatsSnapshot};
use crate::timers::{SilenceCommand, SilenceTimerHandle, TimerCoordinator};
use crate::types::{ConnectionId, Direction, TerminationReason};

/// Dependencies a caller-initiated call must satisfy before readiness.
const INBOUND_DEPS: &[&str] = &[
    deps::TRANSPORT_SDP_READY,
    deps::TRANSPORT_AUDIO_READY,
    deps::MODEL_CONNECTION_READY,
    deps::MODEL_AUDIO_READY,
    deps::MODEL_CONTROL_CHANNEL_READY,
];

/// Dependencies a bridge-initiated call must satisfy before readiness.
const OUTBOUND_DEPS: &[&str] = &[
    deps::REMOTE_CALL_ACCEPTED,
    deps::REMOTE_AUDIO_READY,
    deps::MODEL_CONNECTION_READY,
    deps::MODEL_AUDIO_READY,
    deps::MODEL_CONTROL_CHANNEL_READY,
];

/// Readiness topic to lifecycle dependency name.
const READINESS_TOPICS: &[(EventTopic, &str)] = &[
    (EventTopic::TransportSdpReady, deps::TRANSPORT_SDP_READY),
    (EventTopic::TransportAudioReady, deps::TRANSPORT_AUDIO_READY),
    (EventTopic::ModelConnectionReady, deps::MODEL_CONNECTION_READY),
    (EventTopic::ModelAudioReady, deps::MODEL_AUDIO_READY),
    (
        EventTopic::ModelControlChannelReady,
        deps::MODEL_CONTROL_CHANNEL_READY,
    ),
    (EventTopic::RemoteAudioReady, deps::REMOTE_AUDIO_READY),
    (EventTopic::RemoteCallAccepted, deps::REMOTE_CALL_ACCEPTED),
];

/// Result of answering an inbound call.
#[derive(Debug)]
pub struct AcceptedCall {
    /// Identifier for all further operations on this call.
    pub connection_id: ConnectionId,
    /// Answer SDP to return to the telephony peer.
    pub answer_sdp: String,
}

/// Result of initiating an outbound call.
#[derive(Debug)]
pub struct DialedCall {
    /// Identifier for all further operations on this call.
    pub connection_id: ConnectionId,
    /// Offer SDP to deliver to the remote peer.
    pub offer_sdp: String,
}

struct CallHandle {
    telephony: Arc<PeerSession>,
    /// Model leg, attached after the transport leg. Forwarding tasks
    /// wait on this before pushing audio.
    model: watch::Sender<Option<Arc<dyn ModelSession>>>,
    model_peer: Mutex<Option<Arc<PeerSession>>>,
    silence: Mutex<Option<SilenceTimerHandle>>,
    max_duration: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallHandle {
    fn new(telephony: Arc<PeerSession>) -> Arc<Self> {
        let (model, _) = watch::channel(None);
        Arc::new(Self {
            telephony,
            model,
            model_peer: Mutex::new(None),
            silence: Mutex::new(None),
            max_duration: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }
}

struct Inner {
    config: BridgeConfig,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
    lifecycle: LifecycleManager,
    negotiator: SessionNegotiator,
    delegate: Arc<dyn CallBridgeDelegate>,
    gate: Arc<dyn ToolCallGate>,
    cache: Arc<dyn AudioCache>,
    background_clip: Option<BackgroundClip>,
    calls: DashMap<ConnectionId, Arc<CallHandle>>,
}

/// Entry point for running bridged calls.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    /// Build an orchestrator and install its event subscriptions.
    pub async fn new(
        config: BridgeConfig,
        delegate: Arc<dyn CallBridgeDelegate>,
        gate: Arc<dyn ToolCallGate>,
        cache: Arc<dyn AudioCache>,
    ) -> Result<Self> {
        let bus = EventBus::new(config.event_bus_config());
        let lifecycle = LifecycleManager::new(bus.clone(), config.cleanup_delay());
        let negotiator = SessionNegotiator::new(config.negotiator.clone());
        let background_clip = load_background_clip(&config).await;

        let inner = Arc::new(Inner {
            config,
            bus,
            registry: Arc::new(ConnectionRegistry::new()),
            lifecycle,
            negotiator,
            delegate,
            gate,
            cache,
            background_clip,
            calls: DashMap::new(),
        });
        Inner::install_handlers(&inner).await;
        Ok(Self { inner })
    }

    /// The bus this orchestrator publishes and listens on. Integrations
    /// publish speech-activity and readiness events here.
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Registry counter snapshot.
    pub async fn stats(&self) -> RegistryStatsSnapshot {
        self.inner.registry.stats().await
    }

    /// Answer an inbound call: negotiate the transport leg and register
    /// the connection. The model leg is attached separately with
    /// [`CallOrchestrator::connect_model_leg`].
    pub async fn accept_call(
        &self,
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        remote_offer: &str,
    ) -> Result<AcceptedCall> {
        let inner = &self.inner;
        let id = ConnectionId::new();

        // Negotiate before touching any bookkeeping: a rejected offer
        // must leave no connection state behind.
        let (session, events) = inner.negotiator.answer(remote_offer).await?;
        let telephony = Arc::new(session);
        let answer_sdp = telephony.local_sdp().to_string();

        let connection = match inner
            .registry
            .register(Connection::new(id, tenant_id, agent_id, Direction::Inbound))
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                let _ = telephony.close().await;
                return Err(e);
            }
        };
        if let Err(e) = inner.lifecycle.register_connection(id, INBOUND_DEPS).await {
            let _ = inner.registry.remove(id).await;
            let _ = telephony.close().await;
            return Err(e);
        }

        let handle = CallHandle::new(telephony);
        inner.calls.insert(id, Arc::clone(&handle));

        // The duration ceiling starts at setup; a call that stalls
        // before Ready still times out.
        let timers = inner.call_timers(id, &connection);
        *handle.max_duration.lock().await = Some(timers.spawn_max_duration());

        let pump = tokio::spawn(Inner::pump_telephony(
            Arc::clone(inner),
            id,
            events,
            Arc::clone(&handle),
            connection,
            EventTopic::TransportAudioReady,
        ));
        handle.track_task(pump).await;

        inner
            .bus
            .publish(BridgeEvent::for_connection(
                EventTopic::TransportSdpReady,
                id.to_string(),
            ))
            .await;

        Ok(AcceptedCall {
            connection_id: id,
            answer_sdp,
        })
    }

    /// Initiate an outbound call toward a remote peer. The returned
    /// offer is delivered out of band; the answer comes back through
    /// [`CallOrchestrator::complete_dial`].
    pub async fn dial_call(
        &self,
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Result<DialedCall> {
        let inner = &self.inner;
        let id = ConnectionId::new();

        let (session, events) = inner.negotiator.offer().await?;
        let telephony = Arc::new(session);
        let offer_sdp = telephony.local_sdp().to_string();

        let connection = match inner
            .registry
            .register(Connection::new(
                id,
                tenant_id,
                agent_id,
                Direction::Outbound,
            ))
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                let _ = telephony.close().await;
                return Err(e);
            }
        };
        if let Err(e) = inner
            .lifecycle
            .register_connection(id, OUTBOUND_DEPS)
            .await
        {
            let _ = inner.registry.remove(id).await;
            let _ = telephony.close().await;
            return Err(e);
        }

        let handle = CallHandle::new(telephony);
        inner.calls.insert(id, Arc::clone(&handle));

        let timers = inner.call_timers(id, &connection);
        *handle.max_duration.lock().await = Some(timers.spawn_max_duration());

        let pump = tokio::spawn(Inner::pump_telephony(
            Arc::clone(inner),
            id,
            events,
            Arc::clone(&handle),
            connection,
            EventTopic::RemoteAudioReady,
        ));
        handle.track_task(pump).await;

        Ok(DialedCall {
            connection_id: id,
            offer_sdp,
        })
    }

    /// Apply the remote answer to an outbound call.
    pub async fn complete_dial(&self, id: ConnectionId, answer_sdp: &str) -> Result<()> {
        let handle = self.handle(id)?;
        handle.telephony.accept_answer(answer_sdp).await?;
        self.inner
            .bus
            .publish(BridgeEvent::for_connection(
                EventTopic::RemoteCallAccepted,
                id.to_string(),
            ))
            .await;
        Ok(())
    }

    /// Attach the model leg: produce an offer for the model endpoint.
    /// Its answer comes back through
    /// [`CallOrchestrator::complete_model_leg`].
    pub async fn connect_model_leg(&self, id: ConnectionId) -> Result<String> {
        let inner = &self.inner;
        let handle = self.handle(id)?;
        let connection = inner.registry.get(id).await?;

        let (session, events) = inner.negotiator.offer().await?;
        let peer = Arc::new(session);
        let offer_sdp = peer.local_sdp().to_string();

        let model: Arc<dyn ModelSession> = Arc::new(PeerModelSession::new(
            Arc::clone(&peer),
            inner.config.opus_bitrate,
        )?);
        *handle.model_peer.lock().await = Some(Arc::clone(&peer));
        handle.model.send_replace(Some(model));

        let pump = tokio::spawn(Inner::pump_model(
            Arc::clone(inner),
            id,
            events,
            Arc::clone(&handle),
            connection,
        ));
        handle.track_task(pump).await;

        Ok(offer_sdp)
    }

    /// Apply the model endpoint's answer and report the connection
    /// dependency satisfied.
    pub async fn complete_model_leg(&self, id: ConnectionId, answer_sdp: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let peer = {
            let guard = handle.model_peer.lock().await;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| SessionError::Internal("model leg not started".to_string()))?
        };
        peer.accept_answer(answer_sdp).await?;
        self.inner
            .bus
            .publish(BridgeEvent::for_connection(
                EventTopic::ModelConnectionReady,
                id.to_string(),
            ))
            .await;
        Ok(())
    }

    /// Terminate a call. Idempotent; the full teardown sequence runs on
    /// the first call only. Terminating an unknown id is a no-op.
    pub async fn terminate(&self, id: ConnectionId, reason: TerminationReason) -> Result<()> {
        let first = match self.inner.lifecycle.terminate_connection(id, reason).await {
            Ok(first) => first,
            Err(SessionError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if first {
            Inner::run_termination(Arc::clone(&self.inner), id, reason).await;
        }
        Ok(())
    }

    /// Withhold or release inbound user audio toward the model.
    /// Suppressed frames still count as activity.
    pub async fn set_user_audio_suppressed(&self, id: ConnectionId, suppressed: bool) -> Result<()> {
        let connection = self.inner.registry.get(id).await?;
        connection
            .suppress_inbound
            .store(suppressed, Ordering::Release);
        Ok(())
    }

    fn handle(&self, id: ConnectionId) -> Result<Arc<CallHandle>> {
        self.inner
            .calls
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound(id))
    }
}

impl Inner {
    async fn install_handlers(inner: &Arc<Self>) {
        // Readiness topics feed the lifecycle dependency map.
        for (topic, dep) in READINESS_TOPICS.iter().cloned() {
            let weak = Arc::downgrade(inner);
            inner
                .bus
                .subscribe(topic, move |event| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        let Some(id) = event_connection(&event) else { return };
                        if let Err(e) = inner.lifecycle.mark_dependency_ready(id, dep).await {
                            debug!(connection = %id, dependency = dep, "readiness ignored: {}", e);
                        }
                    })
                })
                .await;
        }

        // Readiness starts timers and sends the greeting.
        let weak = Arc::downgrade(inner);
        inner
            .bus
            .subscribe(EventTopic::ConnectionReady, move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let Some(id) = event_connection(&event) else { return };
                    tokio::spawn(Inner::on_ready(inner, id));
                })
            })
            .await;

        // Termination requests from timers or integrations.
        let weak = Arc::downgrade(inner);
        inner
            .bus
            .subscribe(EventTopic::TerminationRequested, move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let Some(id) = event_connection(&event) else { return };
                    let reason = event
                        .payload_str("reason")
                        .map(TerminationReason::from_reason_str)
                        .unwrap_or(TerminationReason::Default);
                    // The teardown outlives the handler timeout; run it
                    // on its own task.
                    tokio::spawn(async move {
                        let orchestrator = CallOrchestrator { inner };
                        if let Err(e) = orchestrator.terminate(id, reason).await {
                            warn!(connection = %id, "termination failed: {}", e);
                        }
                    });
                })
            })
            .await;

        // Inactivity prompts go to the model via the delegate.
        let weak = Arc::downgrade(inner);
        inner
            .bus
            .subscribe(EventTopic::InactivityPrompt, move |event| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let Some(id) = event_connection(&event) else { return };
                    let retry = event
                        .payload
                        .get("retry")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32;
                    inner.send_inactivity_prompt(id, retry).await;
                })
            })
            .await;

        // Speech activity drives the silence timer.
        for (topic, command) in [
            (EventTopic::ModelSpeechStopped, SilenceCommand::Arm),
            (EventTopic::ModelSpeechStarted, SilenceCommand::Pause),
            (EventTopic::UserSpeechStarted, SilenceCommand::Reset),
        ] {
            let weak = Arc::downgrade(inner);
            inner
                .bus
                .subscribe(topic, move |event| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        let Some(id) = event_connection(&event) else { return };
                        if command == SilenceCommand::Arm {
                            // The model finishing an utterance also ends
                            // any greeting-time suppression.
                            if let Ok(connection) = inner.registry.get(id).await {
                                connection.suppress_inbound.store(false, Ordering::Release);
                            }
                        }
                        inner.silence_command(id, command).await;
                    })
                })
                .await;
        }
    }

    fn call_timers(&self, id: ConnectionId, connection: &Arc<Connection>) -> TimerCoordinator {
        TimerCoordinator::new(
            id,
            self.bus.clone(),
            Arc::clone(&connection.activity),
            Arc::clone(&self.gate),
            self.config.silence_window(),
            self.config.silence_retry_max,
            self.config.max_call_duration(),
        )
    }

    async fn on_ready(inner: Arc<Self>, id: ConnectionId) {
        let Ok(connection) = inner.registry.get(id).await else {
            return;
        };
        let Some(handle) = inner.calls.get(&id).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let timers = inner.call_timers(id, &connection);
        *handle.silence.lock().await = Some(timers.spawn_silence());
        info!(connection = %id, "silence timer armed");

        if let Some(message) = inner.delegate.greeting(id).await {
            // Hold the caller's audio back until the greeting has been
            // spoken; the model mishears itself otherwise. Cleared when
            // the model stops speaking.
            connection.suppress_inbound.store(true, Ordering::Release);
            let model = handle.model.borrow().clone();
            if let Some(model) = model {
                if let Err(e) = model.send_control_message(&message).await {
                    warn!(connection = %id, "greeting not delivered: {}", e);
                    connection.suppress_inbound.store(false, Ordering::Release);
                }
            }
        }
    }

    async fn send_inactivity_prompt(&self, id: ConnectionId, retry: u32) {
        let Some(message) = self.delegate.inactivity_prompt(id, retry).await else {
            return;
        };
        let model = match self.calls.get(&id) {
            Some(handle) => handle.model.borrow().clone(),
            None => return,
        };
        if let Some(model) = model {
            if let Err(e) = model.send_control_message(&message).await {
                warn!(connection = %id, retry, "inactivity prompt not delivered: {}", e);
            }
        }
    }

    async fn silence_command(&self, id: ConnectionId, command: SilenceCommand) {
        let Some(handle) = self.calls.get(&id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let guard = handle.silence.lock().await;
        if let Some(timer) = guard.as_ref() {
            timer.send(command).await;
        }
    }

    /// Consume transport-leg events: forward inbound audio to the model
    /// and relay the user's control messages opaquely.
    async fn pump_telephony(
        inner: Arc<Self>,
        id: ConnectionId,
        events: PeerSessionEvents,
        handle: Arc<CallHandle>,
        connection: Arc<Connection>,
        audio_topic: EventTopic,
    ) {
        let PeerSessionEvents {
            mut inbound_tracks,
            mut control_open,
            mut control_messages,
        } = events;

        // User-facing control channel: relay messages to the model as-is.
        let relay = {
            let model_rx = handle.model.subscribe();
            tokio::spawn(async move {
                while let Some(text) = control_messages.recv().await {
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                        warn!("discarding non-JSON control message from peer");
                        continue;
                    };
                    let model = model_rx.borrow().clone();
                    if let Some(model) = model {
                        if let Err(e) = model.send_control_message(&value).await {
                            debug!("control relay to model failed: {}", e);
                        }
                    }
                }
            })
        };
        handle.track_task(relay).await;

        let open_log = tokio::spawn(async move {
            while let Some(dc) = control_open.recv().await {
                debug!(label = %dc.label(), "user-facing control channel open");
            }
        });
        handle.track_task(open_log).await;

        let mut model_rx = handle.model.subscribe();
        while let Some(track) = inbound_tracks.recv().await {
            inner
                .bus
                .publish(BridgeEvent::for_connection(
                    audio_topic.clone(),
                    id.to_string(),
                ))
                .await;

            let codec = match inner.claim_codec(id, StreamRole::TelephonyInbound).await {
                Some(codec) => codec,
                None => continue,
            };

            // Audio cannot flow until the model leg exists.
            let model = match model_rx.wait_for(Option::is_some).await {
                Ok(guard) => match guard.as_ref() {
                    Some(model) => Arc::clone(model),
                    None => continue,
                },
                Err(_) => break,
            };

            let suppress = Arc::clone(&connection.suppress_inbound);
            let bridge = CodecBridge::with_codec(
                id.to_string(),
                StreamRole::TelephonyInbound,
                inner.config.codec_bridge_config(),
                codec,
                RemoteTrackSource::new(track, Arc::clone(&connection.closed)),
                Arc::new(ModelAudioSink::new(model)),
                Arc::clone(&connection.activity),
                Arc::clone(&connection.closed),
            )
            .with_suppression_gate(Arc::new(move || suppress.load(Ordering::Acquire)))
            .with_cache(Arc::clone(&inner.cache));

            let task = Inner::spawn_bridge(Arc::clone(&inner), id, connection.clone(), bridge);
            handle.track_task(task).await;
        }
        debug!(connection = %id, "telephony event pump finished");
    }

    /// Consume model-leg events: report readiness, forward model audio
    /// to the telephony peer, relay control messages, and mask dead air
    /// during tool calls.
    async fn pump_model(
        inner: Arc<Self>,
        id: ConnectionId,
        events: PeerSessionEvents,
        handle: Arc<CallHandle>,
        connection: Arc<Connection>,
    ) {
        let PeerSessionEvents {
            mut inbound_tracks,
            mut control_open,
            mut control_messages,
        } = events;

        let opens = {
            let bus = inner.bus.clone();
            tokio::spawn(async move {
                while let Some(_dc) = control_open.recv().await {
                    bus.publish(BridgeEvent::for_connection(
                        EventTopic::ModelControlChannelReady,
                        id.to_string(),
                    ))
                    .await;
                }
            })
        };
        handle.track_task(opens).await;

        // Model control messages go to the user opaquely.
        let relay = {
            let telephony = Arc::clone(&handle.telephony);
            tokio::spawn(async move {
                while let Some(text) = control_messages.recv().await {
                    if let Err(e) = telephony.send_control_text(&text).await {
                        debug!("control relay to peer failed: {}", e);
                    }
                }
            })
        };
        handle.track_task(relay).await;

        while let Some(track) = inbound_tracks.recv().await {
            inner
                .bus
                .publish(BridgeEvent::for_connection(
                    EventTopic::ModelAudioReady,
                    id.to_string(),
                ))
                .await;

            let codec = match inner.claim_codec(id, StreamRole::ModelInbound).await {
                Some(codec) => codec,
                None => continue,
            };

            let sink = Arc::new(LocalTrackSink::new(handle.telephony.outbound_track()));
            let bridge = CodecBridge::with_codec(
                id.to_string(),
                StreamRole::ModelInbound,
                inner.config.codec_bridge_config(),
                codec,
                RemoteTrackSource::new(track, Arc::clone(&connection.closed)),
                Arc::clone(&sink) as Arc<dyn voicebridge_media_core::FrameSink>,
                Arc::clone(&connection.activity),
                Arc::clone(&connection.closed),
            )
            .with_cache(Arc::clone(&inner.cache));

            let task = Inner::spawn_bridge(Arc::clone(&inner), id, connection.clone(), bridge);
            handle.track_task(task).await;

            // Dead-air masking toward the caller while a tool call runs.
            if let Some(clip) = inner.background_clip.clone() {
                let gate = Arc::clone(&inner.gate);
                let injector = BackgroundAudioInjector::new(
                    id.to_string(),
                    clip,
                    sink,
                    Arc::clone(&connection.activity),
                    Arc::clone(&connection.closed),
                    Arc::new(move || gate.is_call_in_flight(id)),
                    inner.config.idle_threshold(),
                );
                handle.track_task(tokio::spawn(injector.run())).await;
            }
        }
        debug!(connection = %id, "model event pump finished");
    }

    fn spawn_bridge(
        inner: Arc<Self>,
        id: ConnectionId,
        connection: Arc<Connection>,
        bridge: CodecBridge<RemoteTrackSource>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stats = bridge.run().await;
            debug!(connection = %id, ?stats, "forwarding task done");
            // A source ending while the call is live means the peer went
            // away; ask for an ordinary teardown.
            if !connection.closed.load(Ordering::Acquire) {
                inner
                    .bus
                    .publish(
                        BridgeEvent::for_connection(
                            EventTopic::TerminationRequested,
                            id.to_string(),
                        )
                        .with_payload(serde_json::json!({
                            "reason": TerminationReason::Default.as_str()
                        })),
                    )
                    .await;
            }
        })
    }

    async fn claim_codec(&self, id: ConnectionId, role: StreamRole) -> Option<OpusAudioCodec> {
        let state = match self
            .registry
            .codec_state(id, role, self.config.opus_bitrate)
        {
            Ok(state) => state,
            Err(e) => {
                warn!(connection = %id, %role, "codec state unavailable: {}", e);
                return None;
            }
        };
        let codec = state.take_codec().await;
        if codec.is_none() {
            debug!(connection = %id, %role, "forwarder already running for this stream");
        }
        codec
    }

    /// Teardown sequence, run once per connection: farewell, grace,
    /// closed flag, timers, legs, cache. Proceeds past every failure.
    async fn run_termination(inner: Arc<Self>, id: ConnectionId, reason: TerminationReason) {
        info!(connection = %id, %reason, "running termination sequence");
        let handle = inner.calls.remove(&id).map(|(_, handle)| handle);

        if let Some(handle) = &handle {
            if let Some(message) = inner.delegate.farewell(id, reason).await {
                match handle.telephony.send_control_text(&message.to_string()).await {
                    Ok(()) => tokio::time::sleep(inner.config.farewell_grace()).await,
                    Err(e) => debug!(connection = %id, "farewell not delivered: {}", e),
                }
            }
        }

        if let Err(e) = inner.registry.close(id).await {
            debug!(connection = %id, "close flag: {}", e);
        }

        if let Some(handle) = handle {
            if let Some(silence) = handle.silence.lock().await.take() {
                silence.stop().await;
            }
            if let Some(task) = handle.max_duration.lock().await.take() {
                task.abort();
            }

            let model = handle.model.borrow().clone();
            if let Some(model) = model {
                if let Err(e) = model.close().await {
                    debug!(connection = %id, "model leg close: {}", e);
                }
            }
            if let Err(e) = handle.telephony.close().await {
                debug!(connection = %id, "transport leg close: {}", e);
            }

            for task in handle.tasks.lock().await.drain(..) {
                task.abort();
            }
        }

        if let Err(e) = inner.cache.cleanup(&id.to_string()).await {
            debug!(connection = %id, "cache cleanup: {}", e);
        }

        // Registry bookkeeping follows the lifecycle's deferred removal.
        let registry = Arc::clone(&inner.registry);
        let delay = inner.config.cleanup_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = registry.remove(id).await;
        });
    }
}

async fn load_background_clip(config: &BridgeConfig) -> Option<BackgroundClip> {
    let path = config.background_clip.as_ref()?;
    let mut encoder = match OpusAudioCodec::new(config.opus_bitrate) {
        Ok(codec) => codec,
        Err(e) => {
            warn!("background clip encoder unavailable: {}", e);
            return None;
        }
    };
    match BackgroundClip::from_pcm_file(path, &mut encoder).await {
        Ok(clip) => {
            info!(path = %path.display(), frames = clip.len(), "background clip loaded");
            Some(clip)
        }
        Err(e) => {
            warn!(path = %path.display(), "background clip not loaded: {}", e);
            None
        }
    }
}

fn event_connection(event: &BridgeEvent) -> Option<ConnectionId> {
    event.connection_id.as_deref()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use voicebridge_media_core::NoopAudioCache;

    use crate::delegate::NoToolCalls;

    struct ScriptedDelegate {
        farewells: AtomicUsize,
        last_reason: std::sync::Mutex<Option<TerminationReason>>,
    }

    impl ScriptedDelegate {
        fn last_reason(&self) -> Option<TerminationReason> {
            *self.last_reason.lock().unwrap()
        }
    }

    #[async_trait]
    impl CallBridgeDelegate for ScriptedDelegate {
        async fn greeting(&self, _id: ConnectionId) -> Option<serde_json::Value> {
            Some(serde_json::json!({ "type": "greeting" }))
        }

        async fn inactivity_prompt(
            &self,
            _id: ConnectionId,
            retry: u32,
        ) -> Option<serde_json::Value> {
            Some(serde_json::json!({ "type": "prompt", "retry": retry }))
        }

        async fn farewell(
            &self,
            _id: ConnectionId,
            reason: TerminationReason,
        ) -> Option<serde_json::Value> {
            self.farewells.fetch_add(1, Ordering::SeqCst);
            *self.last_reason.lock().unwrap() = Some(reason);
            Some(serde_json::json!({ "type": "farewell", "reason": reason.as_str() }))
        }
    }

    async fn orchestrator() -> (CallOrchestrator, Arc<ScriptedDelegate>) {
        orchestrator_with(BridgeConfig {
            farewell_grace_ms: 10,
            cleanup_delay_secs: 0,
            ..Default::default()
        })
        .await
    }

    async fn orchestrator_with(config: BridgeConfig) -> (CallOrchestrator, Arc<ScriptedDelegate>) {
        let delegate = Arc::new(ScriptedDelegate {
            farewells: AtomicUsize::new(0),
            last_reason: std::sync::Mutex::new(None),
        });
        let orchestrator = CallOrchestrator::new(
            config,
            delegate.clone(),
            Arc::new(NoToolCalls),
            Arc::new(NoopAudioCache),
        )
        .await
        .unwrap();
        (orchestrator, delegate)
    }

    #[tokio::test]
    async fn accept_call_produces_answer_and_registers() {
        let (orchestrator, _) = orchestrator().await;
        let offer = sample_offer().await;

        let accepted = orchestrator
            .accept_call("tenant-1", "agent-1", &offer)
            .await
            .unwrap();
        assert!(accepted.answer_sdp.starts_with("v=0"));

        let stats = orchestrator.stats().await;
        assert_eq!(stats.active, 1);

        orchestrator
            .terminate(accepted.connection_id, TerminationReason::Default)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_offer_leaves_no_bookkeeping_behind() {
        let (orchestrator, _) = orchestrator().await;
        let err = orchestrator
            .accept_call("tenant-1", "agent-1", "this is not a session description")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));

        let stats = orchestrator.stats().await;
        assert_eq!(stats.total_created, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn duration_ceiling_fires_for_a_call_that_never_becomes_ready() {
        let (orchestrator, delegate) = orchestrator_with(BridgeConfig {
            max_call_duration_secs: 1,
            farewell_grace_ms: 10,
            cleanup_delay_secs: 0,
            ..Default::default()
        })
        .await;
        let offer = sample_offer().await;

        // The model leg is never attached, so readiness never fires.
        orchestrator
            .accept_call("tenant-1", "agent-1", &offer)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1800)).await;

        assert_eq!(delegate.farewells.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.last_reason(), Some(TerminationReason::Timeout));
    }

    #[tokio::test]
    async fn terminate_runs_teardown_once() {
        let (orchestrator, delegate) = orchestrator().await;
        let offer = sample_offer().await;
        let accepted = orchestrator
            .accept_call("tenant-1", "agent-1", &offer)
            .await
            .unwrap();

        orchestrator
            .terminate(accepted.connection_id, TerminationReason::Silence)
            .await
            .unwrap();
        orchestrator
            .terminate(accepted.connection_id, TerminationReason::Default)
            .await
            .unwrap();

        assert_eq!(delegate.farewells.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminating_unknown_connection_is_a_noop() {
        let (orchestrator, delegate) = orchestrator().await;
        orchestrator
            .terminate(ConnectionId::new(), TerminationReason::Default)
            .await
            .unwrap();
        assert_eq!(delegate.farewells.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_leg_before_transport_is_rejected() {
        let (orchestrator, _) = orchestrator().await;
        let err = orchestrator
            .connect_model_leg(ConnectionId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    /// Build a realistic inbound offer with a loopback peer connection.
    async fn sample_offer() -> String {
        use webrtc::api::media_engine::MediaEngine;
        use webrtc::api::APIBuilder;
        use webrtc::peer_connection::configuration::RTCConfiguration;
        use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

        let mut media = MediaEngine::default();
        media.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.create_data_channel("events", None).await.unwrap();
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        let mut done = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), done.recv()).await;
        pc.local_description().await.unwrap().sdp
    }
}
