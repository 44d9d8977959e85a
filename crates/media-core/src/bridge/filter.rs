//! Per-frame forwarding decisions: DTX sparsification and duplicate
//! suppression.
//!
//! Pure state machine over payload bytes, no I/O, so the forwarding
//! heuristics are testable frame by frame.

use bytes::Bytes;

/// Tunable thresholds for the forwarding filter.
///
/// The sparsify ratio and repeat limit are tuned constants carried from
/// production traffic observation; they are configuration, not invariants.
#[derive(Debug, Clone)]
pub struct ForwardFilterConfig {
    /// Frames shorter than this many bytes are DTX/silence markers, not
    /// real audio. Covers the 1-byte canonical silence marker.
    pub dtx_max_len: usize,
    /// Forward every Nth consecutive DTX frame as synthesized silence;
    /// drop the rest.
    pub dtx_sparsify_ratio: u32,
    /// Forward a payload repeated back-to-back at most this many times.
    pub duplicate_limit: u32,
}

impl Default for ForwardFilterConfig {
    fn default() -> Self {
        Self {
            dtx_max_len: 3,
            dtx_sparsify_ratio: 4,
            duplicate_limit: 3,
        }
    }
}

/// Why a frame was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// DTX marker thinned out by sparsification
    DtxThinned,
    /// Payload identical to the previous frames beyond the repeat limit
    Duplicate,
}

/// Decision for one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Real audio, forward it
    Forward,
    /// DTX marker selected to keep the remote VAD's quiet pattern stable;
    /// forward a synthesized full-length 20 ms silence frame instead
    ForwardSilence,
    /// Do not forward
    Drop(DropReason),
}

/// Rolling per-stream forwarding state.
#[derive(Debug)]
pub struct ForwardFilter {
    config: ForwardFilterConfig,
    consecutive_dtx: u32,
    last_payload: Option<Bytes>,
    repeat_count: u32,
}

impl ForwardFilter {
    /// Create a filter with the given thresholds. A sparsify ratio of
    /// zero is treated as one (forward every DTX marker).
    pub fn new(mut config: ForwardFilterConfig) -> Self {
        config.dtx_sparsify_ratio = config.dtx_sparsify_ratio.max(1);
        Self {
            config,
            consecutive_dtx: 0,
            last_payload: None,
            repeat_count: 0,
        }
    }

    /// Classify one frame and update rolling state.
    pub fn evaluate(&mut self, payload: &Bytes) -> FrameDecision {
        if payload.len() < self.config.dtx_max_len {
            // DTX marker. Forward the 1st, (1+N)th, (1+2N)th... as
            // synthesized silence so the remote sees a stable quiet
            // pattern instead of bursty gaps.
            self.consecutive_dtx += 1;
            if (self.consecutive_dtx - 1) % self.config.dtx_sparsify_ratio == 0 {
                return FrameDecision::ForwardSilence;
            }
            return FrameDecision::Drop(DropReason::DtxThinned);
        }

        // A normal frame resets the DTX run immediately.
        self.consecutive_dtx = 0;

        match &self.last_payload {
            Some(last) if last == payload => {
                self.repeat_count += 1;
            }
            _ => {
                self.last_payload = Some(payload.clone());
                self.repeat_count = 1;
            }
        }

        if self.repeat_count > self.config.duplicate_limit {
            FrameDecision::Drop(DropReason::Duplicate)
        } else {
            FrameDecision::Forward
        }
    }

    /// Current consecutive-DTX run length (diagnostics).
    pub fn consecutive_dtx(&self) -> u32 {
        self.consecutive_dtx
    }
}

impl Default for ForwardFilter {
    fn default() -> Self {
        Self::new(ForwardFilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtx() -> Bytes {
        Bytes::from_static(&[0xF8]) // canonical 1-byte silence marker
    }

    fn frame(fill: u8) -> Bytes {
        Bytes::from(vec![fill; 40])
    }

    #[test]
    fn twelve_dtx_frames_forward_exactly_three_silences() {
        let mut filter = ForwardFilter::default();

        let decisions: Vec<FrameDecision> =
            (0..12).map(|_| filter.evaluate(&dtx())).collect();

        let silence_positions: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == FrameDecision::ForwardSilence)
            .map(|(i, _)| i + 1)
            .collect();

        assert_eq!(silence_positions, vec![1, 5, 9]);
        assert_eq!(
            decisions
                .iter()
                .filter(|d| **d == FrameDecision::Drop(DropReason::DtxThinned))
                .count(),
            9
        );
    }

    #[test]
    fn real_frame_resets_dtx_run() {
        let mut filter = ForwardFilter::default();

        assert_eq!(filter.evaluate(&dtx()), FrameDecision::ForwardSilence);
        assert_eq!(filter.evaluate(&dtx()), FrameDecision::Drop(DropReason::DtxThinned));

        assert_eq!(filter.evaluate(&frame(1)), FrameDecision::Forward);
        assert_eq!(filter.consecutive_dtx(), 0);

        // After the reset the next DTX starts a fresh run and forwards.
        assert_eq!(filter.evaluate(&dtx()), FrameDecision::ForwardSilence);
    }

    #[test]
    fn two_byte_frames_are_dtx() {
        let mut filter = ForwardFilter::default();
        let two = Bytes::from_static(&[0xF8, 0x00]);
        assert_eq!(filter.evaluate(&two), FrameDecision::ForwardSilence);
    }

    #[test]
    fn duplicates_suppressed_after_third_repeat() {
        let mut filter = ForwardFilter::default();

        for _ in 0..3 {
            assert_eq!(filter.evaluate(&frame(7)), FrameDecision::Forward);
        }
        for _ in 0..2 {
            assert_eq!(filter.evaluate(&frame(7)), FrameDecision::Drop(DropReason::Duplicate));
        }

        // Any byte difference resets the repeat counter.
        assert_eq!(filter.evaluate(&frame(8)), FrameDecision::Forward);
        assert_eq!(filter.evaluate(&frame(8)), FrameDecision::Forward);
    }

    #[test]
    fn zero_sparsify_ratio_forwards_every_dtx_marker() {
        let mut filter = ForwardFilter::new(ForwardFilterConfig {
            dtx_sparsify_ratio: 0,
            ..ForwardFilterConfig::default()
        });

        for _ in 0..4 {
            assert_eq!(filter.evaluate(&dtx()), FrameDecision::ForwardSilence);
        }
    }

    #[test]
    fn dtx_frames_do_not_break_a_duplicate_run() {
        let mut filter = ForwardFilter::default();

        filter.evaluate(&frame(7));
        filter.evaluate(&frame(7));
        filter.evaluate(&frame(7));
        filter.evaluate(&dtx());
        // Still the same payload as before the marker: the loop it guards
        // against (frozen comfort-noise) spans DTX gaps.
        assert_eq!(filter.evaluate(&frame(7)), FrameDecision::Drop(DropReason::Duplicate));
    }
}
