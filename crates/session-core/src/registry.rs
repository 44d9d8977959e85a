//! Connection registry.
//!
//! Read-mostly map of live connections plus the per-direction codec
//! state table. Codec state creation is the one hot-path insert that
//! can race (both legs' first packets arrive together), so it goes
//! through a `DashMap` entry, which holds the shard lock across the
//! check-and-insert and mechanically guarantees exactly one state per
//! `(connection, role)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use voicebridge_media_core::{ActivityClock, OpusAudioCodec, StreamRole};

use crate::errors::{Result, SessionError};
use crate::types::{ConnectionId, Direction};

/// One live bridged call.
#[derive(Debug)]
pub struct Connection {
    /// Identifier shared with lifecycle state and events.
    pub id: ConnectionId,
    /// Tenant owning the call.
    pub tenant_id: String,
    /// Agent persona answering the call.
    pub agent_id: String,
    /// Who initiated the call.
    pub direction: Direction,
    /// Last-audio-activity clock shared by both forwarding directions.
    pub activity: Arc<ActivityClock>,
    /// Cooperative cancellation flag read by every per-connection task.
    pub closed: Arc<AtomicBool>,
    /// While set, inbound user audio is withheld from the model leg
    /// (still counted as activity). Set around the greeting.
    pub suppress_inbound: Arc<AtomicBool>,
    /// When the connection was registered.
    pub created_at: Instant,
}

impl Connection {
    /// Create a connection record.
    pub fn new(
        id: ConnectionId,
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            id,
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            direction,
            activity: Arc::new(ActivityClock::new()),
            closed: Arc::new(AtomicBool::new(false)),
            suppress_inbound: Arc::new(AtomicBool::new(false)),
            created_at: Instant::now(),
        }
    }

    /// Whether the connection has been marked closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Per-direction codec state, created on first packet arrival.
///
/// The codec inside is claimed exactly once by the forwarding task for
/// that direction; a second claimant (the loser of a first-packet race)
/// gets `None` and must not start another forwarder.
pub struct CodecState {
    codec: Mutex<Option<OpusAudioCodec>>,
}

impl CodecState {
    fn new(bitrate: Option<i32>) -> Result<Self> {
        Ok(Self {
            codec: Mutex::new(Some(OpusAudioCodec::new(bitrate)?)),
        })
    }

    /// Take ownership of the codec. Returns `None` once claimed.
    pub async fn take_codec(&self) -> Option<OpusAudioCodec> {
        self.codec.lock().await.take()
    }
}

/// Aggregate counters over the registry's lifetime.
#[derive(Debug, Default)]
pub struct RegistryStats {
    created: AtomicU64,
    removed: AtomicU64,
}

/// Snapshot of [`RegistryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    /// Connections registered since startup.
    pub total_created: u64,
    /// Connections removed since startup.
    pub total_removed: u64,
    /// Currently registered connections.
    pub active: u64,
}

/// Holds every live connection and its codec state.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    codec_states: DashMap<(ConnectionId, StreamRole), Arc<CodecState>>,
    stats: RegistryStats,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            codec_states: DashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    /// Insert a new connection. Fails on a duplicate id.
    pub async fn register(&self, connection: Connection) -> Result<Arc<Connection>> {
        let id = connection.id;
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(SessionError::AlreadyRegistered(id));
        }
        let connection = Arc::new(connection);
        connections.insert(id, Arc::clone(&connection));
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        info!(connection = %id, direction = %connection.direction, "connection registered");
        Ok(connection)
    }

    /// Look up a connection by id.
    pub async fn get(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Mark a connection closed so its tasks wind down cooperatively.
    pub async fn close(&self, id: ConnectionId) -> Result<()> {
        let connection = self.get(id).await?;
        connection.closed.store(true, Ordering::Release);
        debug!(connection = %id, "closed flag set");
        Ok(())
    }

    /// Remove a connection and its codec states.
    pub async fn remove(&self, id: ConnectionId) -> Result<()> {
        {
            let mut connections = self.connections.write().await;
            connections.remove(&id).ok_or(SessionError::NotFound(id))?;
        }
        self.codec_states
            .retain(|(conn, _), _| *conn != id);
        self.stats.removed.fetch_add(1, Ordering::Relaxed);
        debug!(connection = %id, "connection removed from registry");
        Ok(())
    }

    /// Codec state for one direction, created on first use.
    ///
    /// Concurrent first-packet arrival on both legs resolves to a single
    /// state per `(connection, role)`; the entry holds its shard lock
    /// across the check-and-insert.
    pub fn codec_state(
        &self,
        id: ConnectionId,
        role: StreamRole,
        bitrate: Option<i32>,
    ) -> Result<Arc<CodecState>> {
        match self.codec_states.entry((id, role)) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                debug!(connection = %id, %role, "creating codec state");
                let state = Arc::new(CodecState::new(bitrate)?);
                entry.insert(Arc::clone(&state));
                Ok(state)
            }
        }
    }

    /// Number of live connections.
    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            total_created: self.stats.created.load(Ordering::Relaxed),
            total_removed: self.stats.removed.load(Ordering::Relaxed),
            active: self.active_count().await as u64,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        registry
            .register(Connection::new(id, "tenant-1", "agent-1", Direction::Inbound))
            .await
            .unwrap();

        let connection = registry.get(id).await.unwrap();
        assert_eq!(connection.tenant_id, "tenant-1");
        assert!(!connection.is_closed());

        let err = registry.get(ConnectionId::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        registry
            .register(Connection::new(id, "t", "a", Direction::Inbound))
            .await
            .unwrap();
        let err = registry
            .register(Connection::new(id, "t", "a", Direction::Inbound))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn racing_first_frames_create_one_codec_state() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = ConnectionId::new();
        registry
            .register(Connection::new(id, "t", "a", Direction::Inbound))
            .await
            .unwrap();

        let a = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.codec_state(id, StreamRole::TelephonyInbound, None)
            })
        };
        let b = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.codec_state(id, StreamRole::TelephonyInbound, None)
            })
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Exactly one racer can claim the codec.
        let claimed = first.take_codec().await;
        assert!(claimed.is_some());
        assert!(second.take_codec().await.is_none());

        // Distinct roles hold distinct state.
        let other = registry
            .codec_state(id, StreamRole::ModelInbound, None)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert!(other.take_codec().await.is_some());
    }

    #[tokio::test]
    async fn removal_drops_codec_states_and_counts() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        registry
            .register(Connection::new(id, "t", "a", Direction::Outbound))
            .await
            .unwrap();
        registry
            .codec_state(id, StreamRole::TelephonyInbound, None)
            .unwrap();

        registry.remove(id).await.unwrap();
        assert!(registry.codec_states.is_empty());

        let stats = registry.stats().await;
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_removed, 1);
        assert_eq!(stats.active, 0);
    }
}
