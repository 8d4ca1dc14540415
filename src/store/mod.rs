//! Backing store adapters for session persistence
//!
//! One async interface, two implementations: an in-process map with a
//! janitor timer for single-instance deployments, and a Valkey
//! (Redis-protocol) client for multi-instance deployments. The backing
//! store is the single source of truth on any cache/store disagreement.

pub mod cache;
pub mod memory;
pub mod valkey;

pub use cache::{spawn_cache_cleanup_task, CacheStats, SessionCache};
pub use memory::MemoryBackend;
pub use valkey::ValkeyBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::link::{BindOutcome, LinkMetadata};
use crate::session::Session;
use crate::types::Result;

/// Channel carrying the generic cross-instance "session ended" signal
pub const SESSION_ENDED_CHANNEL: &str = "session-ended";

/// Activity-specific broadcast channel for one session
pub fn session_broadcast_channel(id: &str) -> String {
    format!("session:{id}:broadcast")
}

/// Uniform async store interface: session CRUD with TTL, pub/sub fan-out,
/// persistent-link records with an atomic bind, and windowed counters for
/// rate limiting.
///
/// All link mutations that decide the waiting-to-started transition are
/// atomic at this layer, so two instances racing to authenticate the same
/// hash cannot both win.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    async fn get(&self, id: &str) -> Result<Option<Session>>;

    async fn set(&self, session: &Session, ttl: Duration) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Refresh `lastActivity` and the TTL in one atomic store operation.
    /// Returns false when the session does not exist.
    async fn touch(&self, id: &str, at_ms: u64, ttl: Duration) -> Result<bool>;

    /// List every session id. Cursor-scans the keyspace on Valkey;
    /// expensive, keep off hot paths.
    async fn get_all_ids(&self) -> Result<Vec<String>>;

    /// Fetch every session. Same cost caveat as [`get_all_ids`](Self::get_all_ids).
    async fn get_all(&self) -> Result<Vec<Session>>;

    /// Reap expired entries where the store does not expire them itself.
    /// Returns the number of entries removed.
    async fn cleanup(&self) -> Result<usize>;

    async fn close(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. Messages are fanned out through a bounded
    /// broadcast channel; slow consumers observe lagged errors instead of
    /// back-pressuring the publisher.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;

    // ------------------------------------------------------------------
    // Persistent-link records
    // ------------------------------------------------------------------

    async fn link_get(&self, hash: &str) -> Result<Option<LinkMetadata>>;

    /// Create the record unless one already exists; returns the record
    /// that is now authoritative. First write wins.
    async fn link_put_if_absent(&self, hash: &str, meta: LinkMetadata) -> Result<LinkMetadata>;

    /// Bind a session to the link iff it is not already started.
    /// This is the sole authority for the waiting-to-started transition.
    async fn link_bind_session(
        &self,
        hash: &str,
        session_id: &str,
        teacher_socket_id: &str,
        hashed_teacher_code: &str,
    ) -> Result<BindOutcome>;

    /// Clear `sessionId`/`teacherSocketId` so the link can be reused.
    /// Returns false when no record exists.
    async fn link_reset(&self, hash: &str) -> Result<bool>;

    async fn link_delete(&self, hash: &str) -> Result<()>;

    /// Every link record, for the idle-GC sweep. Not a hot path.
    async fn link_all(&self) -> Result<Vec<(String, LinkMetadata)>>;

    // ------------------------------------------------------------------
    // Rate-limit counters
    // ------------------------------------------------------------------

    /// Current value of a windowed counter (0 when absent or expired)
    async fn counter_get(&self, key: &str) -> Result<i64>;

    /// Atomically increment a counter, arming its expiry on first increment
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64>;
}

/// Spawn the periodic TTL reaper for backends that need one.
pub fn spawn_store_cleanup_task(backend: Arc<dyn SessionBackend>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match backend.cleanup().await {
                Ok(0) => {}
                Ok(reaped) => debug!(reaped, "Expired sessions reaped"),
                Err(e) => warn!(error = %e, "Store cleanup failed"),
            }
        }
    });
    info!(
        interval_secs = interval.as_secs(),
        "Store cleanup task started"
    );
}
