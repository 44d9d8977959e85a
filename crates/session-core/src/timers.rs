//! Per-connection timers.
//!
//! Two timers guard every call. The max-duration timer is a hard
//! ceiling: when it fires the connection is asked to terminate with
//! reason `timeout`. The silence timer watches for an unresponsive
//! caller: armed when the model stops speaking, paused (retries
//! preserved) while it speaks, fully reset when the caller starts
//! speaking. When the window elapses it consults the activity clock and
//! the tool-call gate before counting a retry, so raced audio or a
//! long-running tool call never burns the retry budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use voicebridge_infra_common::{BridgeEvent, EventBus, EventTopic};
use voicebridge_media_core::ActivityClock;

use crate::delegate::ToolCallGate;
use crate::types::{ConnectionId, TerminationReason};

/// Commands accepted by a running silence timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceCommand {
    /// The model stopped speaking; start (or restart) the window.
    Arm,
    /// The model started speaking; stop the countdown, keep retries.
    Pause,
    /// The caller started speaking; clear retries and restart the window.
    Reset,
    /// The connection is terminating; exit the timer task.
    Stop,
}

/// Spawns and owns the timer tasks for one connection.
pub struct TimerCoordinator {
    id: ConnectionId,
    bus: EventBus,
    activity: Arc<ActivityClock>,
    gate: Arc<dyn ToolCallGate>,
    silence_window: Duration,
    silence_retry_max: u32,
    max_call_duration: Duration,
}

/// Handle to a running silence timer.
pub struct SilenceTimerHandle {
    tx: mpsc::Sender<SilenceCommand>,
    task: JoinHandle<()>,
}

impl SilenceTimerHandle {
    /// Send a command. Silently dropped if the timer already exited.
    pub async fn send(&self, command: SilenceCommand) {
        let _ = self.tx.send(command).await;
    }

    /// Stop the timer and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.tx.send(SilenceCommand::Stop).await;
        let _ = self.task.await;
    }
}

impl TimerCoordinator {
    /// Create a coordinator for one connection.
    pub fn new(
        id: ConnectionId,
        bus: EventBus,
        activity: Arc<ActivityClock>,
        gate: Arc<dyn ToolCallGate>,
        silence_window: Duration,
        silence_retry_max: u32,
        max_call_duration: Duration,
    ) -> Self {
        Self {
            id,
            bus,
            activity,
            gate,
            silence_window,
            silence_retry_max,
            max_call_duration,
        }
    }

    /// Spawn the max-duration timer. Fires once, requesting termination
    /// with reason `timeout`.
    pub fn spawn_max_duration(&self) -> JoinHandle<()> {
        let id = self.id;
        let bus = self.bus.clone();
        let ceiling = self.max_call_duration;
        tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            info!(connection = %id, ceiling = ?ceiling, "max call duration reached");
            bus.publish(
                BridgeEvent::for_connection(EventTopic::TerminationRequested, id.to_string())
                    .with_payload(serde_json::json!({
                        "reason": TerminationReason::Timeout.as_str()
                    })),
            )
            .await;
        })
    }

    /// Spawn the silence timer, initially disarmed.
    pub fn spawn_silence(&self) -> SilenceTimerHandle {
        let (tx, mut rx) = mpsc::channel::<SilenceCommand>(16);
        let id = self.id;
        let bus = self.bus.clone();
        let activity = Arc::clone(&self.activity);
        let gate = Arc::clone(&self.gate);
        let window = self.silence_window;
        let retry_max = self.silence_retry_max;

        let task = tokio::spawn(async move {
            let mut retries = 0u32;
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                let expiry = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    command = rx.recv() => match command {
                        Some(SilenceCommand::Arm) => {
                            deadline = Some(tokio::time::Instant::now() + window);
                        }
                        Some(SilenceCommand::Pause) => {
                            deadline = None;
                        }
                        Some(SilenceCommand::Reset) => {
                            retries = 0;
                            deadline = Some(tokio::time::Instant::now() + window);
                        }
                        Some(SilenceCommand::Stop) | None => break,
                    },
                    _ = expiry => {
                        // Audio that raced the expiry re-arms silently.
                        if activity.active_within(window) {
                            debug!(connection = %id, "silence window raced by audio, re-arming");
                            deadline = Some(tokio::time::Instant::now() + window);
                            continue;
                        }

                        // A tool call keeps the model legitimately quiet;
                        // wait it out without burning a retry.
                        if gate.is_call_in_flight(id) {
                            debug!(connection = %id, "tool call in flight, re-arming");
                            deadline = Some(tokio::time::Instant::now() + window);
                            continue;
                        }

                        retries += 1;
                        if retries < retry_max {
                            info!(connection = %id, retry = retries, "caller silent, prompting");
                            bus.publish(
                                BridgeEvent::for_connection(
                                    EventTopic::InactivityPrompt,
                                    id.to_string(),
                                )
                                .with_payload(serde_json::json!({ "retry": retries })),
                            )
                            .await;
                            deadline = Some(tokio::time::Instant::now() + window);
                        } else {
                            info!(connection = %id, retries, "silence retries exhausted");
                            bus.publish(
                                BridgeEvent::for_connection(
                                    EventTopic::TerminationRequested,
                                    id.to_string(),
                                )
                                .with_payload(serde_json::json!({
                                    "reason": TerminationReason::Silence.as_str()
                                })),
                            )
                            .await;
                            break;
                        }
                    }
                }
            }
            debug!(connection = %id, "silence timer exited");
        });

        SilenceTimerHandle { tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use voicebridge_infra_common::EventBusConfig;

    struct FlagGate(AtomicBool);

    impl ToolCallGate for FlagGate {
        fn is_call_in_flight(&self, _id: ConnectionId) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    struct Fixture {
        coordinator: TimerCoordinator,
        bus: EventBus,
        activity: Arc<ActivityClock>,
        gate: Arc<FlagGate>,
    }

    fn fixture(window: Duration, retry_max: u32) -> Fixture {
        let bus = EventBus::with_layers(EventBusConfig::default(), Vec::new());
        let activity = Arc::new(ActivityClock::new());
        let gate = Arc::new(FlagGate(AtomicBool::new(false)));
        let coordinator = TimerCoordinator::new(
            ConnectionId::new(),
            bus.clone(),
            activity.clone(),
            gate.clone(),
            window,
            retry_max,
            Duration::from_secs(300),
        );
        Fixture {
            coordinator,
            bus,
            activity,
            gate,
        }
    }

    async fn count_topic(bus: &EventBus, topic: EventTopic) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        bus.subscribe(topic, move |_| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .await;
        counter
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_requests_timeout_termination() {
        let fx = fixture(Duration::from_secs(20), 5);
        let requests = count_topic(&fx.bus, EventTopic::TerminationRequested).await;

        let task = fx.coordinator.spawn_max_duration();
        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(requests.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        task.await.unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn raced_activity_rearms_without_prompting() {
        let fx = fixture(Duration::from_secs(20), 5);
        let prompts = count_topic(&fx.bus, EventTopic::InactivityPrompt).await;

        let timer = fx.coordinator.spawn_silence();
        timer.send(SilenceCommand::Arm).await;

        // Audio lands mid-window; the expiry must re-arm silently.
        tokio::time::sleep(Duration::from_secs(15)).await;
        fx.activity.touch();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 0);

        // A full quiet window after the touch does prompt.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tool_call_rearms_without_counting() {
        let fx = fixture(Duration::from_secs(20), 2);
        let prompts = count_topic(&fx.bus, EventTopic::InactivityPrompt).await;
        fx.gate.0.store(true, Ordering::Release);

        let timer = fx.coordinator.spawn_silence();
        timer.send(SilenceCommand::Arm).await;

        // Several windows elapse while the tool call runs; no prompts.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 0);

        fx.gate.0.store(false, Ordering::Release);
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_request_silence_termination() {
        let fx = fixture(Duration::from_secs(10), 3);
        let prompts = count_topic(&fx.bus, EventTopic::InactivityPrompt).await;
        let requests = count_topic(&fx.bus, EventTopic::TerminationRequested).await;

        let timer = fx.coordinator.spawn_silence();
        timer.send(SilenceCommand::Arm).await;

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_preserves_retries_and_reset_clears_them() {
        let fx = fixture(Duration::from_secs(10), 3);
        let prompts = count_topic(&fx.bus, EventTopic::InactivityPrompt).await;

        let timer = fx.coordinator.spawn_silence();
        timer.send(SilenceCommand::Arm).await;

        // First prompt.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        // Model speaks: countdown pauses, no prompt accrues.
        timer.send(SilenceCommand::Pause).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        // Caller speaks: retries cleared, window restarts.
        timer.send(SilenceCommand::Reset).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(prompts.load(Ordering::SeqCst), 2);

        timer.stop().await;
    }
}
