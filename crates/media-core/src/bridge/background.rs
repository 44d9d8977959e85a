//! Background-audio injection.
//!
//! While a slow asynchronous tool call is in flight and no real audio has
//! been forwarded for longer than the idle threshold, a pre-encoded cue
//! clip is streamed as 20 ms frames to mask dead air. Injection stops the
//! instant real audio resumes, observed through the shared activity clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::codec::{OpusAudioCodec, FRAME_SAMPLES_20MS};
use crate::error::{Error, Result};
use crate::types::{ActivityClock, FrameSink, SinkFrame};

/// Nominal injection cadence, one 20 ms frame per tick.
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Predicate: is an asynchronous tool/function call currently in flight
/// for this connection? Injection only runs while it returns true.
pub type ToolCallProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// A cue clip pre-chopped into 20 ms Opus frames.
#[derive(Debug, Clone)]
pub struct BackgroundClip {
    frames: Vec<Bytes>,
}

impl BackgroundClip {
    /// Build a clip from already-encoded 20 ms frames.
    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self> {
        if frames.is_empty() {
            return Err(Error::Clip("clip has no frames".to_string()));
        }
        Ok(Self { frames })
    }

    /// Load a raw PCM file (s16le, 48 kHz, mono), chop it into 20 ms
    /// frames, and encode each with the given codec. A trailing partial
    /// frame is zero-padded.
    pub async fn from_pcm_file(path: &std::path::Path, codec: &mut OpusAudioCodec) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Clip(format!("read {}: {}", path.display(), e)))?;
        if raw.len() < 2 {
            return Err(Error::Clip(format!("{} is not a PCM clip", path.display())));
        }

        let samples: Vec<i16> = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        let mut frames = Vec::with_capacity(samples.len() / FRAME_SAMPLES_20MS + 1);
        for chunk in samples.chunks(FRAME_SAMPLES_20MS) {
            let frame = if chunk.len() == FRAME_SAMPLES_20MS {
                codec.encode(chunk)?
            } else {
                let mut padded = chunk.to_vec();
                padded.resize(FRAME_SAMPLES_20MS, 0);
                codec.encode(&padded)?
            };
            frames.push(frame);
        }

        Self::from_frames(frames)
    }

    /// Number of 20 ms frames in the clip.
    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Streams the cue clip while the destination leg is idle during a
/// pending tool call. One injector task per connection.
pub struct BackgroundAudioInjector {
    connection_id: String,
    clip: BackgroundClip,
    sink: Arc<dyn FrameSink>,
    activity: Arc<ActivityClock>,
    closed: Arc<AtomicBool>,
    tool_call_active: ToolCallProbe,
    idle_threshold: Duration,
}

impl BackgroundAudioInjector {
    /// Create an injector. `idle_threshold` is how long the destination
    /// must have been silent before injection starts (default policy 1 s).
    pub fn new(
        connection_id: impl Into<String>,
        clip: BackgroundClip,
        sink: Arc<dyn FrameSink>,
        activity: Arc<ActivityClock>,
        closed: Arc<AtomicBool>,
        tool_call_active: ToolCallProbe,
        idle_threshold: Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            clip,
            sink,
            activity,
            closed,
            tool_call_active,
            idle_threshold,
        }
    }

    /// Run until the connection closes. Intended to be spawned.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut cursor = 0usize;
        let mut injecting = false;

        loop {
            ticker.tick().await;

            if self.closed.load(Ordering::Acquire) {
                debug!(connection = %self.connection_id, "background injector stopping");
                return;
            }

            let idle = self.activity.idle() >= self.idle_threshold;
            let should_inject = idle && (self.tool_call_active)();

            if !should_inject {
                if injecting {
                    trace!(connection = %self.connection_id, "real audio resumed, pausing clip");
                    injecting = false;
                    cursor = 0;
                }
                continue;
            }

            if !injecting {
                debug!(connection = %self.connection_id, "masking dead air with background clip");
                injecting = true;
            }

            let payload = self.clip.frames[cursor].clone();
            cursor = (cursor + 1) % self.clip.frames.len();

            let frame = SinkFrame::Encoded {
                payload,
                duration: FRAME_INTERVAL,
            };
            match self.sink.write(frame).await {
                Ok(()) => {}
                Err(Error::SinkClosed) => {
                    debug!(connection = %self.connection_id, "sink gone, injector stopping");
                    return;
                }
                Err(e) => {
                    // Injection is a nicety; losing a frame of it is not
                    // worth ending the task.
                    warn!(connection = %self.connection_id, "background frame write failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        written: AtomicUsize,
    }

    #[async_trait]
    impl FrameSink for CountingSink {
        fn wants_pcm(&self) -> bool {
            false
        }

        async fn write(&self, _frame: SinkFrame) -> Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn clip() -> BackgroundClip {
        BackgroundClip::from_frames(vec![
            Bytes::from_static(&[1, 2, 3, 4]),
            Bytes::from_static(&[5, 6, 7, 8]),
        ])
        .unwrap()
    }

    #[test]
    fn empty_clip_is_rejected() {
        assert!(BackgroundClip::from_frames(Vec::new()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn injects_while_idle_during_tool_call() {
        let sink = Arc::new(CountingSink {
            written: AtomicUsize::new(0),
        });
        let activity = Arc::new(ActivityClock::new());
        let closed = Arc::new(AtomicBool::new(false));

        // Idle threshold zero: with no touches the leg counts as idle.
        let injector = BackgroundAudioInjector::new(
            "conn-1",
            clip(),
            sink.clone(),
            activity,
            closed.clone(),
            Arc::new(|| true),
            Duration::ZERO,
        );
        let task = tokio::spawn(injector.run());

        tokio::time::sleep(Duration::from_millis(200)).await;

        closed.store(true, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.await.unwrap();

        assert!(sink.written.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_injection_without_tool_call() {
        let sink = Arc::new(CountingSink {
            written: AtomicUsize::new(0),
        });
        let activity = Arc::new(ActivityClock::new());
        let closed = Arc::new(AtomicBool::new(false));

        let injector = BackgroundAudioInjector::new(
            "conn-1",
            clip(),
            sink.clone(),
            activity,
            closed.clone(),
            Arc::new(|| false),
            Duration::ZERO,
        );
        let task = tokio::spawn(injector.run());

        tokio::time::sleep(Duration::from_millis(200)).await;

        closed.store(true, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.await.unwrap();

        assert_eq!(sink.written.load(Ordering::SeqCst), 0);
    }
}
