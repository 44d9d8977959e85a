//! The per-direction forwarding loop.
//!
//! One [`CodecBridge`] runs as one long-lived task per direction per
//! connection: it reads discrete Opus frames from the source leg, applies
//! the forwarding filter, transcodes when the destination wants PCM, and
//! writes to the destination leg. It terminates when the source ends, the
//! connection's closed flag is set, or the sink reports it is gone.

pub mod background;
pub mod filter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::cache::AudioCache;
use crate::codec::{OpusAudioCodec, FRAME_SAMPLES_20MS};
use crate::error::{Error, Result};
use crate::types::{ActivityClock, FrameFormat, FrameSink, FrameSource, SinkFrame, StreamRole};

use filter::{DropReason, ForwardFilter, ForwardFilterConfig, FrameDecision};

/// Nominal frame duration used for synthesized and passthrough frames.
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// How many write failures are logged before going quiet.
const WRITE_ERROR_LOG_LIMIT: u32 = 5;

/// Decode failures are logged once per this many packets.
const DECODE_LOG_MODULUS: u64 = 100;

/// Configuration for one forwarding direction.
#[derive(Debug, Clone, Default)]
pub struct CodecBridgeConfig {
    /// Forwarding filter thresholds
    pub filter: ForwardFilterConfig,
    /// Encoder bitrate for synthesized/transcoded frames, when set
    pub opus_bitrate: Option<i32>,
}

/// Counters accumulated over the life of one forwarding task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Real frames forwarded to the destination
    pub forwarded: u64,
    /// Synthesized silence frames forwarded in place of DTX runs
    pub silence_forwarded: u64,
    /// Frames dropped by DTX thinning
    pub dtx_dropped: u64,
    /// Frames dropped by duplicate suppression
    pub duplicates_dropped: u64,
    /// Frames withheld by the suppression gate
    pub suppressed: u64,
    /// Frames dropped because decoding failed
    pub decode_failures: u64,
    /// Frames lost to non-fatal write errors
    pub write_failures: u64,
}

/// Caller-supplied per-frame gate; returning `true` withholds the frame
/// from the destination (e.g. user audio during the initial greeting).
pub type SuppressionGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// One direction of the media bridge.
pub struct CodecBridge<S: FrameSource> {
    connection_id: String,
    role: StreamRole,
    source: S,
    sink: Arc<dyn FrameSink>,
    codec: OpusAudioCodec,
    filter: ForwardFilter,
    activity: Arc<ActivityClock>,
    closed: Arc<AtomicBool>,
    gate: Option<SuppressionGate>,
    cache: Option<Arc<dyn AudioCache>>,
    stats: ForwardStats,
    packet_seq: u64,
    write_errors_logged: u32,
}

impl<S: FrameSource> CodecBridge<S> {
    /// Build a forwarding task for one direction.
    pub fn new(
        connection_id: impl Into<String>,
        role: StreamRole,
        config: CodecBridgeConfig,
        source: S,
        sink: Arc<dyn FrameSink>,
        activity: Arc<ActivityClock>,
        closed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let codec = OpusAudioCodec::new(config.opus_bitrate)?;
        Ok(Self::with_codec(
            connection_id,
            role,
            config,
            codec,
            source,
            sink,
            activity,
            closed,
        ))
    }

    /// Build a forwarding task around an existing codec, for callers that
    /// manage per-stream codec state centrally.
    #[allow(clippy::too_many_arguments)]
    pub fn with_codec(
        connection_id: impl Into<String>,
        role: StreamRole,
        config: CodecBridgeConfig,
        codec: OpusAudioCodec,
        source: S,
        sink: Arc<dyn FrameSink>,
        activity: Arc<ActivityClock>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            role,
            source,
            sink,
            codec,
            filter: ForwardFilter::new(config.filter),
            activity,
            closed,
            gate: None,
            cache: None,
            stats: ForwardStats::default(),
            packet_seq: 0,
            write_errors_logged: 0,
        }
    }

    /// Install a suppression gate consulted per frame.
    pub fn with_suppression_gate(mut self, gate: SuppressionGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Mirror forwarded raw frames to a cache, best-effort.
    pub fn with_cache(mut self, cache: Arc<dyn AudioCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run until the source ends, the connection closes, or the sink is
    /// gone. Returns the accumulated counters.
    pub async fn run(mut self) -> ForwardStats {
        info!(
            connection = %self.connection_id,
            role = %self.role,
            "forwarding task started"
        );

        loop {
            let Some(payload) = self.source.next_frame().await else {
                debug!(connection = %self.connection_id, role = %self.role, "source stream ended");
                break;
            };

            // Cooperative cancellation: once closed, stop forwarding
            // rather than erroring on a dead destination.
            if self.closed.load(Ordering::Acquire) {
                debug!(connection = %self.connection_id, role = %self.role, "connection closed, stopping");
                break;
            }

            self.packet_seq += 1;

            match self.filter.evaluate(&payload) {
                FrameDecision::Drop(DropReason::DtxThinned) => {
                    self.stats.dtx_dropped += 1;
                }
                FrameDecision::Drop(DropReason::Duplicate) => {
                    self.stats.duplicates_dropped += 1;
                }
                FrameDecision::ForwardSilence => {
                    if self.forward_silence().await.is_break() {
                        break;
                    }
                }
                FrameDecision::Forward => {
                    if self.forward_real(payload).await.is_break() {
                        break;
                    }
                }
            }
        }

        info!(
            connection = %self.connection_id,
            role = %self.role,
            forwarded = self.stats.forwarded,
            dropped = self.stats.dtx_dropped + self.stats.duplicates_dropped,
            "forwarding task finished"
        );
        self.stats
    }

    async fn forward_real(&mut self, payload: Bytes) -> std::ops::ControlFlow<()> {
        // Suppressed frames still count as activity so idle-based
        // heuristics (background audio, silence timer) don't misfire.
        if let Some(gate) = &self.gate {
            if gate() {
                self.activity.touch();
                self.stats.suppressed += 1;
                return std::ops::ControlFlow::Continue(());
            }
        }

        let frame = if self.sink.wants_pcm() {
            match self.codec.decode(&payload) {
                Ok(pcm) => SinkFrame::Pcm(pcm),
                Err(e) => {
                    self.stats.decode_failures += 1;
                    // Rate-limit by sequence modulus to avoid log storms
                    // from a persistently bad stream.
                    if self.packet_seq % DECODE_LOG_MODULUS == 0 {
                        warn!(
                            connection = %self.connection_id,
                            role = %self.role,
                            seq = self.packet_seq,
                            "dropping undecodable frame: {}", e
                        );
                    } else {
                        trace!(connection = %self.connection_id, "decode failure: {}", e);
                    }
                    return std::ops::ControlFlow::Continue(());
                }
            }
        } else {
            SinkFrame::Encoded {
                payload: payload.clone(),
                duration: FRAME_DURATION,
            }
        };

        match self.sink.write(frame).await {
            Ok(()) => {
                self.stats.forwarded += 1;
                self.activity.touch();
                self.mirror_to_cache(&payload).await;
                std::ops::ControlFlow::Continue(())
            }
            Err(e) => self.handle_write_error(e),
        }
    }

    async fn forward_silence(&mut self) -> std::ops::ControlFlow<()> {
        let frame = if self.sink.wants_pcm() {
            SinkFrame::Pcm(OpusAudioCodec::pcm_silence_20ms())
        } else {
            match self.codec.encode_silence_20ms() {
                Ok(payload) => SinkFrame::Encoded {
                    payload,
                    duration: FRAME_DURATION,
                },
                Err(e) => {
                    warn!(connection = %self.connection_id, "silence encode failed: {}", e);
                    return std::ops::ControlFlow::Continue(());
                }
            }
        };

        match self.sink.write(frame).await {
            Ok(()) => {
                // Synthesized silence is not real audio; it must not feed
                // the activity clock or the idle heuristics would never
                // see silence.
                self.stats.silence_forwarded += 1;
                std::ops::ControlFlow::Continue(())
            }
            Err(e) => self.handle_write_error(e),
        }
    }

    fn handle_write_error(&mut self, error: Error) -> std::ops::ControlFlow<()> {
        if self.closed.load(Ordering::Acquire) {
            // The connection was torn down under us; exit cleanly.
            return std::ops::ControlFlow::Break(());
        }

        if matches!(error, Error::SinkClosed) {
            debug!(
                connection = %self.connection_id,
                role = %self.role,
                "destination gone, stopping forwarder"
            );
            return std::ops::ControlFlow::Break(());
        }

        self.stats.write_failures += 1;
        if self.write_errors_logged < WRITE_ERROR_LOG_LIMIT {
            self.write_errors_logged += 1;
            warn!(
                connection = %self.connection_id,
                role = %self.role,
                "frame write failed: {}", error
            );
        }
        std::ops::ControlFlow::Continue(())
    }

    async fn mirror_to_cache(&mut self, payload: &Bytes) {
        if let Some(cache) = &self.cache {
            let format = FrameFormat::Opus;
            if let Err(e) = cache
                .cache_frame(&self.connection_id, self.role, format, payload)
                .await
            {
                trace!(connection = %self.connection_id, "cache mirror failed: {}", e);
            }
        }
    }
}

/// PCM length sanity check used by sinks that require whole 20 ms frames.
pub fn is_whole_frame(pcm_len: usize) -> bool {
    pcm_len % FRAME_SAMPLES_20MS == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct VecSource {
        frames: Vec<Bytes>,
    }

    #[async_trait]
    impl FrameSource for VecSource {
        async fn next_frame(&mut self) -> Option<Bytes> {
            if self.frames.is_empty() {
                None
            } else {
                Some(self.frames.remove(0))
            }
        }
    }

    #[derive(Default)]
    struct CaptureSink {
        wants_pcm: bool,
        written: Mutex<Vec<SinkFrame>>,
        fail_after: Option<usize>,
        fatal: bool,
    }

    #[async_trait]
    impl FrameSink for CaptureSink {
        fn wants_pcm(&self) -> bool {
            self.wants_pcm
        }

        async fn write(&self, frame: SinkFrame) -> Result<()> {
            let mut written = self.written.lock().await;
            if let Some(limit) = self.fail_after {
                if written.len() >= limit {
                    return if self.fatal {
                        Err(Error::SinkClosed)
                    } else {
                        Err(Error::WriteFailed("synthetic".to_string()))
                    };
                }
            }
            written.push(frame);
            Ok(())
        }
    }

    fn opus_frame(codec: &mut OpusAudioCodec, seed: i16) -> Bytes {
        let pcm: Vec<i16> = (0..FRAME_SAMPLES_20MS)
            .map(|i| ((i as i32 * seed as i32) % 5000) as i16)
            .collect();
        codec.encode(&pcm).unwrap()
    }

    fn bridge_over(
        frames: Vec<Bytes>,
        sink: Arc<CaptureSink>,
        closed: Arc<AtomicBool>,
    ) -> CodecBridge<VecSource> {
        CodecBridge::new(
            "conn-test",
            StreamRole::TelephonyInbound,
            CodecBridgeConfig::default(),
            VecSource { frames },
            sink,
            Arc::new(ActivityClock::new()),
            closed,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dtx_run_is_sparsified_on_the_wire() {
        let frames = vec![Bytes::from_static(&[0xF8]); 12];
        let sink = Arc::new(CaptureSink::default());
        let closed = Arc::new(AtomicBool::new(false));

        let stats = bridge_over(frames, sink.clone(), closed).run().await;

        assert_eq!(stats.silence_forwarded, 3);
        assert_eq!(stats.dtx_dropped, 9);
        assert_eq!(sink.written.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn pcm_sink_receives_decoded_audio() {
        let mut codec = OpusAudioCodec::new(None).unwrap();
        let frames = vec![opus_frame(&mut codec, 3), opus_frame(&mut codec, 5)];

        let sink = Arc::new(CaptureSink {
            wants_pcm: true,
            ..Default::default()
        });
        let closed = Arc::new(AtomicBool::new(false));

        let stats = bridge_over(frames, sink.clone(), closed).run().await;
        assert_eq!(stats.forwarded, 2);

        let written = sink.written.lock().await;
        for frame in written.iter() {
            match frame {
                SinkFrame::Pcm(pcm) => assert_eq!(pcm.len(), FRAME_SAMPLES_20MS),
                other => panic!("expected PCM, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_not_fatal() {
        let mut codec = OpusAudioCodec::new(None).unwrap();
        let frames = vec![
            Bytes::from(vec![0x03, 0x00, 0x00, 0x00]), // invalid framing
            opus_frame(&mut codec, 3),
        ];

        let sink = Arc::new(CaptureSink {
            wants_pcm: true,
            ..Default::default()
        });
        let closed = Arc::new(AtomicBool::new(false));

        let stats = bridge_over(frames, sink.clone(), closed).run().await;
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.forwarded, 1);
    }

    #[tokio::test]
    async fn closed_flag_stops_forwarding() {
        let mut codec = OpusAudioCodec::new(None).unwrap();
        let frames = vec![opus_frame(&mut codec, 3); 4];

        let sink = Arc::new(CaptureSink::default());
        let closed = Arc::new(AtomicBool::new(true));

        let stats = bridge_over(frames, sink.clone(), closed).run().await;
        assert_eq!(stats.forwarded, 0);
        assert!(sink.written.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sink_gone_ends_the_loop() {
        let mut codec = OpusAudioCodec::new(None).unwrap();
        let mut frames = Vec::new();
        for seed in 1..=6 {
            frames.push(opus_frame(&mut codec, seed));
        }

        let sink = Arc::new(CaptureSink {
            fail_after: Some(2),
            fatal: true,
            ..Default::default()
        });
        let closed = Arc::new(AtomicBool::new(false));

        let stats = bridge_over(frames, sink.clone(), closed).run().await;
        assert_eq!(stats.forwarded, 2);
    }

    #[tokio::test]
    async fn suppression_gate_drops_but_counts_activity() {
        let mut codec = OpusAudioCodec::new(None).unwrap();
        let frames = vec![opus_frame(&mut codec, 3)];

        let sink = Arc::new(CaptureSink::default());
        let closed = Arc::new(AtomicBool::new(false));
        let activity = Arc::new(ActivityClock::new());

        let bridge = CodecBridge::new(
            "conn-test",
            StreamRole::TelephonyInbound,
            CodecBridgeConfig::default(),
            VecSource { frames },
            sink.clone(),
            activity.clone(),
            closed,
        )
        .unwrap()
        .with_suppression_gate(Arc::new(|| true));

        let stats = bridge.run().await;
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.forwarded, 0);
        assert!(sink.written.lock().await.is_empty());
        // The gate drops the frame but last-activity still moves.
        assert!(activity.active_within(Duration::from_secs(1)));
    }
}
