//! Session model and the service that owns it
//!
//! A session is the ephemeral server-side record for one running classroom
//! activity. The service composes the write-back cache with a backing store
//! and is the only component that holds long-lived session references.
//! Activity routes consume it through `get`/`set`/`touch`/`delete`/`get_all`/
//! `create_session` and never see the cache or the store directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::store::{
    session_broadcast_channel, SessionBackend, SessionCache, SESSION_ENDED_CHANNEL,
};
use crate::types::{LecternError, Result};

/// Initial length of generated session ids, in hex characters
const INITIAL_ID_LEN: usize = 6;

/// Collisions tolerated at a given length before the id grows
const COLLISIONS_PER_LEN: u32 = 3;

/// Hard cap on generated id length
const MAX_ID_LEN: usize = 32;

/// Current wall-clock time as epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ephemeral record for one running classroom activity instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Lowercase-hex identifier of adaptive length
    pub id: String,

    /// Activity type (e.g. "raffle", "quiz"), drives normalization
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Creation timestamp, epoch milliseconds
    pub created: u64,

    /// Last activity timestamp, epoch milliseconds. Drives TTL expiry.
    pub last_activity: u64,

    /// Activity-dependent payload, opaque to the store
    #[serde(default)]
    pub data: Map<String, serde_json::Value>,
}

impl Session {
    /// Create a new session with fresh timestamps
    pub fn new(id: String, kind: Option<String>, data: Map<String, serde_json::Value>) -> Self {
        let now = now_ms();
        Self {
            id,
            kind,
            created: now,
            last_activity: now,
            data,
        }
    }

    /// Whether the session has been idle longer than `ttl`
    pub fn is_expired(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.last_activity) > ttl.as_millis() as u64
    }
}

/// Shape-defaulting hook applied to every session leaving the store,
/// keyed by `session.kind`. Registered once per activity at startup.
pub type Normalizer = Arc<dyn Fn(&mut Session) + Send + Sync>;

/// Payload published on the session-ended channel so other instances can
/// notify their local waiters without a store lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedSignal {
    /// Node that initiated the end, so instances can skip their own signal
    pub node_id: String,
    pub session_id: String,
    /// Persistent-link hash that was bound to the session, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Public session API composed from cache + backing store
pub struct SessionService {
    backend: Arc<dyn SessionBackend>,
    cache: Arc<SessionCache>,
    normalizers: DashMap<String, Normalizer>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        cache: SessionCache,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            cache: Arc::new(cache),
            normalizers: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Install the shape-defaulting hook for an activity type.
    /// Called once per activity at startup.
    pub fn register_normalizer(&self, activity_type: &str, normalizer: Normalizer) {
        if self
            .normalizers
            .insert(activity_type.to_string(), normalizer)
            .is_some()
        {
            warn!(activity = activity_type, "Normalizer replaced");
        }
    }

    fn normalize(&self, session: &mut Session) {
        if let Some(kind) = session.kind.clone() {
            if let Some(normalizer) = self.normalizers.get(&kind) {
                normalizer(session);
            }
        }
    }

    /// Fetch a session. Served from cache when fresh; store connectivity
    /// errors degrade to `None` since every caller already handles not-found.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let backend = Arc::clone(&self.backend);
        let fetch_id = id.to_string();
        let mut session = self
            .cache
            .get(id, || async move { backend.get(&fetch_id).await })
            .await?;
        self.normalize(&mut session);
        Some(session)
    }

    /// Write a session through to the store and refresh the cache.
    /// Pass `ttl` to override the configured session TTL for this write.
    pub async fn set(&self, mut session: Session, ttl: Option<Duration>) -> Result<()> {
        self.normalize(&mut session);
        let ttl = ttl.unwrap_or(self.ttl);
        let id = session.id.clone();
        self.backend.set(&session, ttl).await?;
        self.cache.set(&id, session, false);
        Ok(())
    }

    /// Refresh a session's last-activity timestamp.
    ///
    /// Cache-resident ids are touched in the cache only (deferred write);
    /// a cold miss touches the store synchronously so a just-created session
    /// does not silently miss its first TTL renewal.
    pub async fn touch(&self, id: &str) {
        if self.cache.touch(id) {
            return;
        }
        match self.backend.touch(id, now_ms(), self.ttl).await {
            Ok(true) => {}
            Ok(false) => debug!(id, "Touch on unknown session"),
            Err(e) => warn!(id, error = %e, "Store touch failed"),
        }
    }

    /// Delete a session from cache and store. Announcing the end to other
    /// instances is a separate step; see [`publish_session_ended`](Self::publish_session_ended).
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.cache.invalidate(id);
        self.backend.delete(id).await
    }

    /// Announce a session end on the cross-instance channel. Best-effort:
    /// a publish failure is logged, local delivery is unaffected.
    pub async fn publish_session_ended(&self, signal: &SessionEndedSignal) {
        let payload = match serde_json::to_string(signal) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "session-ended signal serialization failed");
                return;
            }
        };
        if let Err(e) = self.backend.publish(SESSION_ENDED_CHANNEL, &payload).await {
            warn!(id = %signal.session_id, error = %e, "session-ended publish failed");
        }
    }

    /// List every live session. Requires a full key scan on the store;
    /// never call this on a hot path.
    pub async fn get_all(&self) -> Vec<Session> {
        match self.backend.get_all().await {
            Ok(mut sessions) => {
                for session in &mut sessions {
                    self.normalize(session);
                }
                sessions
            }
            Err(e) => {
                warn!(error = %e, "Store listing failed");
                Vec::new()
            }
        }
    }

    /// Create a session with a fresh collision-checked id and write it
    /// through immediately, so it is visible to a concurrent read.
    pub async fn create_session(
        &self,
        kind: Option<String>,
        data: Map<String, serde_json::Value>,
    ) -> Result<Session> {
        let id = self.generate_session_id().await?;
        let mut session = Session::new(id.clone(), kind, data);
        self.normalize(&mut session);
        self.backend.set(&session, self.ttl).await?;
        self.cache.set(&id, session.clone(), false);
        info!(id = %id, kind = ?session.kind, "Session created");
        Ok(session)
    }

    /// Generate a lowercase-hex id, growing the length under collision
    /// pressure. Existence is checked against the store, not the cache.
    async fn generate_session_id(&self) -> Result<String> {
        let mut len = INITIAL_ID_LEN;
        let mut collisions = 0u32;
        loop {
            let id = random_hex(len);
            match self.backend.get(&id).await? {
                None => return Ok(id),
                Some(_) => {
                    collisions += 1;
                    if collisions >= COLLISIONS_PER_LEN {
                        collisions = 0;
                        if len < MAX_ID_LEN {
                            len += 1;
                            debug!(len, "Session id length increased after collisions");
                        } else {
                            return Err(LecternError::Store(
                                "session id space exhausted".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Force one session's pending cache write to the store, right before
    /// a response that must observe it.
    pub async fn flush_one(&self, id: &str) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let ttl = self.ttl;
        self.cache
            .flush_one(id, move |session| {
                let backend = Arc::clone(&backend);
                async move { backend.set(&session, ttl).await }
            })
            .await
    }

    /// Flush every dirty cache entry to the store. Individual failures are
    /// logged and retried on the next interval, never immediately.
    pub async fn flush_touches(&self) {
        let backend = Arc::clone(&self.backend);
        let ttl = self.ttl;
        self.cache
            .flush_touches(move |session| {
                let backend = Arc::clone(&backend);
                async move { backend.set(&session, ttl).await }
            })
            .await;
    }

    /// Activity-specific cross-instance broadcast for one session.
    pub async fn publish_broadcast(&self, id: &str, payload: &str) -> Result<()> {
        self.backend
            .publish(&session_broadcast_channel(id), payload)
            .await
    }

    pub async fn subscribe_broadcast(&self, id: &str) -> Result<broadcast::Receiver<String>> {
        self.backend.subscribe(&session_broadcast_channel(id)).await
    }

    pub async fn subscribe_session_ended(&self) -> Result<broadcast::Receiver<String>> {
        self.backend.subscribe(SESSION_ENDED_CHANNEL).await
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Shared handle to the cache, for its background cleanup task
    pub fn cache_handle(&self) -> Arc<SessionCache> {
        Arc::clone(&self.cache)
    }
}

/// Spawn the periodic write-back flush of dirty cache entries.
pub fn spawn_flush_task(service: Arc<SessionService>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            service.flush_touches().await;
        }
    });
    info!(interval_ms = interval.as_millis() as u64, "Cache flush task started");
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut id = hex::encode(bytes);
    id.truncate(len);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn service() -> SessionService {
        let ttl = Duration::from_secs(60);
        let backend: Arc<dyn SessionBackend> = Arc::new(MemoryBackend::new(ttl));
        SessionService::new(backend, SessionCache::new(100, Duration::from_secs(10)), ttl)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let svc = service();
        let session = svc
            .create_session(Some("raffle".to_string()), Map::new())
            .await
            .unwrap();
        assert_eq!(session.id.len(), INITIAL_ID_LEN);
        assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));

        let fetched = svc.get(&session.id).await.expect("session should exist");
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.kind.as_deref(), Some("raffle"));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let svc = service();
        assert!(svc.get("doesnotexist").await.is_none());
    }

    #[tokio::test]
    async fn test_normalizer_backfills_shape() {
        let svc = service();
        svc.register_normalizer(
            "raffle",
            Arc::new(|session| {
                session
                    .data
                    .entry("tickets".to_string())
                    .or_insert_with(|| serde_json::json!([]));
            }),
        );

        let session = svc
            .create_session(Some("raffle".to_string()), Map::new())
            .await
            .unwrap();
        assert!(session.data.contains_key("tickets"));

        let fetched = svc.get(&session.id).await.unwrap();
        assert!(fetched.data["tickets"].is_array());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let svc = service();
        let a = svc.create_session(None, Map::new()).await.unwrap();
        let b = svc.create_session(None, Map::new()).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_delete_removes_session() {
        let svc = service();
        let session = svc.create_session(None, Map::new()).await.unwrap();
        svc.delete(&session.id).await.unwrap();
        assert!(svc.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_touch_cold_miss_hits_store() {
        let ttl = Duration::from_secs(60);
        let backend: Arc<dyn SessionBackend> = Arc::new(MemoryBackend::new(ttl));
        let svc = SessionService::new(
            Arc::clone(&backend),
            SessionCache::new(100, Duration::from_secs(10)),
            ttl,
        );

        let mut session = Session::new("cold01".to_string(), None, Map::new());
        session.last_activity = 1;
        backend.set(&session, ttl).await.unwrap();

        // Not cache-resident, so the store must be touched synchronously.
        svc.touch("cold01").await;
        let stored = backend.get("cold01").await.unwrap().unwrap();
        assert!(stored.last_activity > 1);
    }

    #[tokio::test]
    async fn test_broadcast_channels_are_wired() {
        let svc = service();
        let mut rx = svc.subscribe_broadcast("abc123").await.unwrap();
        svc.publish_broadcast("abc123", "{}").await.unwrap();
        // In-memory pub/sub is a no-op; the subscription stays open, idle.
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_session_serde_shape() {
        let session = Session::new(
            "abc123".to_string(),
            Some("quiz".to_string()),
            Map::new(),
        );
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["type"], "quiz");
        assert!(json["lastActivity"].is_u64());
        assert!(json.get("last_activity").is_none());
    }

    #[test]
    fn test_random_hex_odd_length() {
        let id = random_hex(7);
        assert_eq!(id.len(), 7);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
