//! Opus transcoding state for one direction of one connection.
//!
//! Exclusively owned by the forwarding task that reads the corresponding
//! track; there is no locking inside a stream. Lazy creation under
//! concurrent first-packet arrival is the registry's job, not this
//! module's.

use bytes::Bytes;
use opus::{Application, Bitrate, Channels};

use crate::error::{Error, Result};

/// Sample rate used everywhere in the bridge.
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples in a nominal 20 ms frame at 48 kHz mono.
pub const FRAME_SAMPLES_20MS: usize = 960;

/// Decode buffer size: the largest expected frame is 40 ms, which
/// tolerates the 20/40/60 ms durations peers actually send without
/// truncating the common cases.
pub const MAX_DECODE_SAMPLES: usize = 1920;

/// Upper bound on an encoded Opus frame.
const MAX_ENCODED_BYTES: usize = 4000;

/// Per-direction Opus decoder/encoder pair, 48 kHz mono, VoIP tuning.
pub struct OpusAudioCodec {
    decoder: opus::Decoder,
    encoder: opus::Encoder,
}

impl OpusAudioCodec {
    /// Create a codec with the application-specific bitrate, or the
    /// encoder default when unset.
    pub fn new(bitrate_bps: Option<i32>) -> Result<Self> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| Error::CodecSetup(format!("decoder: {}", e)))?;

        let mut encoder = opus::Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| Error::CodecSetup(format!("encoder: {}", e)))?;

        if let Some(bps) = bitrate_bps {
            encoder
                .set_bitrate(Bitrate::Bits(bps))
                .map_err(|e| Error::CodecSetup(format!("bitrate: {}", e)))?;
        }

        Ok(Self { decoder, encoder })
    }

    /// Decode one Opus frame to linear PCM.
    ///
    /// The output length matches the frame's actual duration; frames longer
    /// than 40 ms fail rather than truncate silently.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; MAX_DECODE_SAMPLES];
        let samples = self
            .decoder
            .decode(frame, &mut pcm, false)
            .map_err(|e| Error::Decode(e.to_string()))?;
        pcm.truncate(samples);
        Ok(pcm)
    }

    /// Encode linear PCM to one Opus frame.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes> {
        let mut out = vec![0u8; MAX_ENCODED_BYTES];
        let written = self
            .encoder
            .encode(pcm, &mut out)
            .map_err(|e| Error::Encode(e.to_string()))?;
        out.truncate(written);
        Ok(Bytes::from(out))
    }

    /// Encode a full-length 20 ms all-zero frame, the synthesized silence
    /// forwarded in place of sparse DTX markers.
    pub fn encode_silence_20ms(&mut self) -> Result<Bytes> {
        let silence = [0i16; FRAME_SAMPLES_20MS];
        self.encode(&silence)
    }

    /// A 20 ms buffer of PCM silence.
    pub fn pcm_silence_20ms() -> Vec<i16> {
        vec![0i16; FRAME_SAMPLES_20MS]
    }
}
