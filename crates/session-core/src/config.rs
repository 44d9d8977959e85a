//! Bridge configuration.
//!
//! One serde-deserializable struct carries every tunable of the stack,
//! with defaults matching production-tested values. Sections that
//! belong to a lower crate (negotiation, forwarding filter, event bus)
//! are projected into that crate's config type on demand.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voicebridge_infra_common::EventBusConfig;
use voicebridge_media_core::{CodecBridgeConfig, ForwardFilterConfig};
use voicebridge_rtc_core::NegotiatorConfig;

/// Top-level configuration for a bridge instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Transport negotiation: ICE servers, relay credentials, Opus
    /// bitrate hint, gathering deadline.
    #[serde(default)]
    pub negotiator: NegotiatorConfig,

    /// Encoder bitrate for transcoded audio, bits per second.
    #[serde(default)]
    pub opus_bitrate: Option<i32>,

    /// DTX runs forward one synthesized silence frame per this many.
    #[serde(default = "default_sparsify_ratio")]
    pub dtx_sparsify_ratio: u32,

    /// Payloads shorter than this many bytes are treated as DTX.
    #[serde(default = "default_dtx_max_len")]
    pub dtx_max_len: usize,

    /// Identical consecutive payloads forwarded before suppression.
    #[serde(default = "default_duplicate_limit")]
    pub duplicate_limit: u32,

    /// Idle time before background audio may start, milliseconds.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// Silence window before an inactivity prompt, seconds.
    #[serde(default = "default_silence_window_secs")]
    pub silence_window_secs: u64,

    /// Inactivity prompts sent before terminating for silence.
    #[serde(default = "default_silence_retry_max")]
    pub silence_retry_max: u32,

    /// Hard ceiling on call duration, seconds.
    #[serde(default = "default_max_call_duration_secs")]
    pub max_call_duration_secs: u64,

    /// Pause between the farewell message and teardown, milliseconds.
    #[serde(default = "default_farewell_grace_ms")]
    pub farewell_grace_ms: u64,

    /// Delay before a terminated connection's bookkeeping is removed,
    /// seconds. In-flight handlers may still resolve the id meanwhile.
    #[serde(default = "default_cleanup_delay_secs")]
    pub cleanup_delay_secs: u64,

    /// Sliding dedup window on the event bus, milliseconds.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Optional raw PCM (s16le, 48 kHz mono) clip looped while a tool
    /// call keeps the model busy.
    #[serde(default)]
    pub background_clip: Option<PathBuf>,
}

fn default_sparsify_ratio() -> u32 {
    4
}
fn default_dtx_max_len() -> usize {
    3
}
fn default_duplicate_limit() -> u32 {
    3
}
fn default_idle_threshold_ms() -> u64 {
    1_000
}
fn default_silence_window_secs() -> u64 {
    20
}
fn default_silence_retry_max() -> u32 {
    5
}
fn default_max_call_duration_secs() -> u64 {
    300
}
fn default_farewell_grace_ms() -> u64 {
    1_000
}
fn default_cleanup_delay_secs() -> u64 {
    5
}
fn default_dedup_window_ms() -> u64 {
    5_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            negotiator: NegotiatorConfig::default(),
            opus_bitrate: None,
            dtx_sparsify_ratio: default_sparsify_ratio(),
            dtx_max_len: default_dtx_max_len(),
            duplicate_limit: default_duplicate_limit(),
            idle_threshold_ms: default_idle_threshold_ms(),
            silence_window_secs: default_silence_window_secs(),
            silence_retry_max: default_silence_retry_max(),
            max_call_duration_secs: default_max_call_duration_secs(),
            farewell_grace_ms: default_farewell_grace_ms(),
            cleanup_delay_secs: default_cleanup_delay_secs(),
            dedup_window_ms: default_dedup_window_ms(),
            background_clip: None,
        }
    }
}

impl BridgeConfig {
    /// Forwarding configuration for one bridge direction.
    pub fn codec_bridge_config(&self) -> CodecBridgeConfig {
        CodecBridgeConfig {
            filter: ForwardFilterConfig {
                dtx_max_len: self.dtx_max_len,
                dtx_sparsify_ratio: self.dtx_sparsify_ratio,
                duplicate_limit: self.duplicate_limit,
            },
            opus_bitrate: self.opus_bitrate,
        }
    }

    /// Event bus configuration derived from the dedup window.
    pub fn event_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            ..Default::default()
        }
    }

    /// Idle threshold as a duration.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    /// Silence window as a duration.
    pub fn silence_window(&self) -> Duration {
        Duration::from_secs(self.silence_window_secs)
    }

    /// Maximum call duration as a duration.
    pub fn max_call_duration(&self) -> Duration {
        Duration::from_secs(self.max_call_duration_secs)
    }

    /// Farewell grace as a duration.
    pub fn farewell_grace(&self) -> Duration {
        Duration::from_millis(self.farewell_grace_ms)
    }

    /// Cleanup delay as a duration.
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.dtx_sparsify_ratio, 4);
        assert_eq!(config.silence_window_secs, 20);
        assert_eq!(config.silence_retry_max, 5);
        assert_eq!(config.max_call_duration_secs, 300);
        assert_eq!(config.cleanup_delay_secs, 5);
    }

    #[test]
    fn deserializes_partial_overrides() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "silence_window_secs": 12, "opus_bitrate": 24000 }"#)
                .unwrap();
        assert_eq!(config.silence_window_secs, 12);
        assert_eq!(config.opus_bitrate, Some(24_000));
        assert_eq!(config.dtx_sparsify_ratio, 4);
    }

    #[test]
    fn projects_filter_config() {
        let config = BridgeConfig::default();
        let bridge = config.codec_bridge_config();
        assert_eq!(bridge.filter.dtx_sparsify_ratio, 4);
        assert_eq!(bridge.filter.duplicate_limit, 3);
    }
}
