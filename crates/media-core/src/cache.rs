//! Audio cache collaborator.
//!
//! Optional diagnostic/compliance recording of raw frames. Strictly
//! best-effort: the forwarding loop ignores cache errors and never blocks
//! its success path on the cache.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{FrameFormat, StreamRole};

/// Best-effort frame recorder keyed by connection and stream role.
#[async_trait]
pub trait AudioCache: Send + Sync {
    /// Record one raw frame. Errors are reported to the caller but must
    /// never interrupt forwarding.
    async fn cache_frame(
        &self,
        connection_id: &str,
        role: StreamRole,
        format: FrameFormat,
        frame: &[u8],
    ) -> Result<()>;

    /// Release everything recorded for a connection.
    async fn cleanup(&self, connection_id: &str) -> Result<()>;
}

/// Cache that records nothing. The default collaborator.
pub struct NoopAudioCache;

#[async_trait]
impl AudioCache for NoopAudioCache {
    async fn cache_frame(
        &self,
        _connection_id: &str,
        _role: StreamRole,
        _format: FrameFormat,
        _frame: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _connection_id: &str) -> Result<()> {
        Ok(())
    }
}
