//! In-process backing store
//!
//! Plain maps behind the [`SessionBackend`] interface for single-instance
//! deployments. A janitor timer reaps sessions whose `lastActivity` exceeds
//! the TTL. Pub/sub is a no-op: there is no second instance to notify, and
//! local delivery happens directly through the waiting room.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::link::{BindOutcome, LinkMetadata};
use crate::session::{now_ms, Session};
use crate::store::SessionBackend;
use crate::types::Result;

struct Counter {
    value: i64,
    expires_at: Instant,
}

/// In-memory session backend with TTL reaping
pub struct MemoryBackend {
    sessions: DashMap<String, Session>,
    links: DashMap<String, LinkMetadata>,
    counters: DashMap<String, Counter>,
    /// Dormant subscriber channels, kept so receivers stay open
    subscriptions: DashMap<String, broadcast::Sender<String>>,
    ttl: Duration,
}

impl MemoryBackend {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            links: DashMap::new(),
            counters: DashMap::new(),
            subscriptions: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        match self.sessions.get(id) {
            Some(session) if session.is_expired(self.ttl, now_ms()) => {
                drop(session);
                self.sessions.remove(id);
                Ok(None)
            }
            Some(session) => Ok(Some(session.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, session: &Session, _ttl: Duration) -> Result<()> {
        // Expiry is derived from lastActivity; the per-write TTL only
        // matters for stores with native key expiry.
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn touch(&self, id: &str, at_ms: u64, _ttl: Duration) -> Result<bool> {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.last_activity = at_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_all_ids(&self) -> Result<Vec<String>> {
        let now = now_ms();
        Ok(self
            .sessions
            .iter()
            .filter(|s| !s.is_expired(self.ttl, now))
            .map(|s| s.id.clone())
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<Session>> {
        let now = now_ms();
        Ok(self
            .sessions
            .iter()
            .filter(|s| !s.is_expired(self.ttl, now))
            .map(|s| s.clone())
            .collect())
    }

    async fn cleanup(&self) -> Result<usize> {
        let now = now_ms();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(self.ttl, now))
            .map(|s| s.id.clone())
            .collect();

        let count = expired.len();
        for id in expired {
            self.sessions.remove(&id);
            debug!(id = %id, "Expired session reaped");
        }
        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, _channel: &str, _payload: &str) -> Result<()> {
        // Single process: nothing to notify across instances.
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let sender = self
            .subscriptions
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(16).0);
        Ok(sender.subscribe())
    }

    async fn link_get(&self, hash: &str) -> Result<Option<LinkMetadata>> {
        Ok(self.links.get(hash).map(|m| m.clone()))
    }

    async fn link_put_if_absent(&self, hash: &str, meta: LinkMetadata) -> Result<LinkMetadata> {
        Ok(self
            .links
            .entry(hash.to_string())
            .or_insert(meta)
            .clone())
    }

    async fn link_bind_session(
        &self,
        hash: &str,
        session_id: &str,
        teacher_socket_id: &str,
        hashed_teacher_code: &str,
    ) -> Result<BindOutcome> {
        // The shard lock held by get_mut makes the check-then-set atomic.
        match self.links.get_mut(hash) {
            Some(mut meta) => {
                if let Some(existing) = &meta.session_id {
                    return Ok(BindOutcome::AlreadyStarted(existing.clone()));
                }
                meta.session_id = Some(session_id.to_string());
                meta.teacher_socket_id = Some(teacher_socket_id.to_string());
                if meta.hashed_teacher_code.is_none() {
                    meta.hashed_teacher_code = Some(hashed_teacher_code.to_string());
                }
                Ok(BindOutcome::Bound(meta.clone()))
            }
            None => Ok(BindOutcome::Missing),
        }
    }

    async fn link_reset(&self, hash: &str) -> Result<bool> {
        match self.links.get_mut(hash) {
            Some(mut meta) => {
                meta.session_id = None;
                meta.teacher_socket_id = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn link_delete(&self, hash: &str) -> Result<()> {
        self.links.remove(hash);
        Ok(())
    }

    async fn link_all(&self) -> Result<Vec<(String, LinkMetadata)>> {
        Ok(self
            .links
            .iter()
            .map(|m| (m.key().clone(), m.clone()))
            .collect())
    }

    async fn counter_get(&self, key: &str) -> Result<i64> {
        match self.counters.get(key) {
            Some(counter) if counter.expires_at > Instant::now() => Ok(counter.value),
            _ => Ok(0),
        }
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + window;
        }
        entry.value += 1;
        Ok(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn session(id: &str) -> Session {
        Session::new(id.to_string(), None, Map::new())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        let s = session("abc");
        backend.set(&s, Duration::from_secs(60)).await.unwrap();
        assert!(backend.get("abc").await.unwrap().is_some());

        backend.delete("abc").await.unwrap();
        assert!(backend.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry_after_cleanup() {
        let backend = MemoryBackend::new(Duration::from_millis(0));
        let mut stale = session("stale");
        stale.last_activity = now_ms().saturating_sub(10);
        backend.set(&stale, Duration::from_millis(0)).await.unwrap();

        let reaped = backend.cleanup().await.unwrap();
        assert_eq!(reaped, 1);
        assert!(backend.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touched_session_survives_cleanup() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        let mut s = session("live");
        s.last_activity = now_ms().saturating_sub(30_000);
        backend.set(&s, Duration::from_secs(60)).await.unwrap();

        backend
            .touch("live", now_ms(), Duration::from_secs(60))
            .await
            .unwrap();
        let reaped = backend.cleanup().await.unwrap();
        assert_eq!(reaped, 0);
        assert!(backend.get("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_session_reads_as_missing() {
        let backend = MemoryBackend::new(Duration::from_millis(1));
        let mut stale = session("gone");
        stale.last_activity = now_ms().saturating_sub(1_000);
        backend.set(&stale, Duration::from_millis(1)).await.unwrap();

        // Lazy expiry on read, even before the janitor runs.
        assert!(backend.get("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_put_if_absent_is_first_write_wins() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        let first = LinkMetadata::new("raffle");
        let stored = backend
            .link_put_if_absent("h", first.clone())
            .await
            .unwrap();
        assert_eq!(stored.activity_name, "raffle");

        let second = LinkMetadata::new("quiz");
        let stored = backend.link_put_if_absent("h", second).await.unwrap();
        assert_eq!(stored.activity_name, "raffle");
    }

    #[tokio::test]
    async fn test_bind_session_exactly_once_under_concurrency() {
        let backend = std::sync::Arc::new(MemoryBackend::new(Duration::from_secs(60)));
        backend
            .link_put_if_absent("h", LinkMetadata::new("raffle"))
            .await
            .unwrap();

        let a = {
            let backend = std::sync::Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .link_bind_session("h", "session-a", "sock-a", "code")
                    .await
                    .unwrap()
            })
        };
        let b = {
            let backend = std::sync::Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .link_bind_session("h", "session-b", "sock-b", "code")
                    .await
                    .unwrap()
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let bound = |o: &BindOutcome| matches!(o, BindOutcome::Bound(_));
        assert!(bound(&a) ^ bound(&b), "exactly one bind must win");

        let meta = backend.link_get("h").await.unwrap().unwrap();
        let winner = meta.session_id.unwrap();
        assert!(winner == "session-a" || winner == "session-b");
    }

    #[tokio::test]
    async fn test_bind_missing_link() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        let outcome = backend
            .link_bind_session("nope", "sid", "sock", "code")
            .await
            .unwrap();
        assert!(matches!(outcome, BindOutcome::Missing));
    }

    #[tokio::test]
    async fn test_reset_clears_binding_for_reuse() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        backend
            .link_put_if_absent("h", LinkMetadata::new("raffle"))
            .await
            .unwrap();
        backend
            .link_bind_session("h", "sid", "sock", "code")
            .await
            .unwrap();

        assert!(backend.link_reset("h").await.unwrap());
        let meta = backend.link_get("h").await.unwrap().unwrap();
        assert!(meta.session_id.is_none());
        assert!(meta.teacher_socket_id.is_none());
        // The embedded secret reference survives reset.
        assert!(meta.hashed_teacher_code.is_some());

        let outcome = backend
            .link_bind_session("h", "sid2", "sock2", "code")
            .await
            .unwrap();
        assert!(matches!(outcome, BindOutcome::Bound(_)));
    }

    #[tokio::test]
    async fn test_counter_window() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        assert_eq!(backend.counter_get("k").await.unwrap(), 0);
        for expected in 1..=3 {
            let n = backend
                .incr_with_expiry("k", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(n, expected);
        }
        assert_eq!(backend.counter_get("k").await.unwrap(), 3);

        // An expired window reads as zero and restarts on increment.
        backend
            .incr_with_expiry("gone", Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(backend.counter_get("gone").await.unwrap(), 0);
        let n = backend
            .incr_with_expiry("gone", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
