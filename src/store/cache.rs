//! Write-back session cache
//!
//! Sits between the session service and the backing store. Reads are served
//! from cache while fresh; `touch` mutates only the cache and marks the id
//! dirty, deferring the store write to the periodic flush. This is the
//! gateway's key latency optimization, since WebSocket keepalives touch at
//! high frequency.
//!
//! Invariant: an entry with `dirty == false` is consistent with the backing
//! store as of its `timestamp`. Dirty entries are queued for flush; a failed
//! flush leaves the entry dirty for the next interval.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::session::{now_ms, Session};
use crate::types::Result;

struct CacheEntry {
    session: Session,
    /// When the session was last known consistent with the store
    timestamp: Instant,
    /// Recency mark for eviction, refreshed on every hit and touch
    last_used: Instant,
    dirty: bool,
}

/// Counters for observability
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Write-back LRU cache keyed by session id
pub struct SessionCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    /// Freshness window: entries older than this fall through to the store
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SessionCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch a session, delegating to `fetch` on a stale or missing entry.
    ///
    /// A successful fetch repopulates the cache as non-dirty, since the
    /// fetch already reflects store truth; a fetch miss purges any stale
    /// entry. Fetch errors degrade to a miss.
    pub async fn get<F, Fut>(&self, id: &str, fetch: F) -> Option<Session>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Session>>>,
    {
        if let Some(mut entry) = self.entries.get_mut(id) {
            if entry.timestamp.elapsed() < self.ttl {
                entry.last_used = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.session.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match fetch().await {
            Ok(Some(session)) => {
                self.set(id, session.clone(), false);
                Some(session)
            }
            Ok(None) => {
                self.entries.remove(id);
                None
            }
            Err(e) => {
                warn!(id, error = %e, "Cache fetch failed");
                None
            }
        }
    }

    /// Insert or replace an entry, evicting the least-recently-touched
    /// entry first when at capacity.
    pub fn set(&self, id: &str, session: Session, dirty: bool) {
        if !self.entries.contains_key(id) {
            self.evict_to_capacity();
        }
        let now = Instant::now();
        self.entries.insert(
            id.to_string(),
            CacheEntry {
                session,
                timestamp: now,
                last_used: now,
                dirty,
            },
        );
    }

    /// Refresh `lastActivity` in the cache only and mark the id dirty.
    /// Returns false when the id is not cache-resident (cold miss); the
    /// caller must then touch the store synchronously.
    pub fn touch(&self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.session.last_activity = now_ms();
                entry.last_used = Instant::now();
                entry.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn invalidate(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|e| e.dirty).count()
    }

    /// Write every dirty entry to the store via `write`. Settle-all:
    /// each write runs independently and a failure leaves its entry dirty
    /// for the next interval. A touch landing mid-flush keeps its mark.
    pub async fn flush_touches<F, Fut>(&self, write: F)
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let snapshots: Vec<(String, Session)> = self
            .entries
            .iter()
            .filter(|entry| entry.dirty)
            .map(|entry| (entry.key().clone(), entry.session.clone()))
            .collect();

        if snapshots.is_empty() {
            return;
        }

        let results = futures::future::join_all(
            snapshots
                .iter()
                .map(|(_, session)| write(session.clone())),
        )
        .await;

        let mut flushed = 0usize;
        for ((id, snapshot), result) in snapshots.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    if let Some(mut entry) = self.entries.get_mut(&id) {
                        // Only clear the mark if no newer touch landed
                        // while this flush was in flight.
                        if entry.session.last_activity == snapshot.last_activity {
                            entry.dirty = false;
                            entry.timestamp = Instant::now();
                        }
                    }
                    flushed += 1;
                }
                Err(e) => warn!(id = %id, error = %e, "Flush failed, will retry next interval"),
            }
        }
        debug!(flushed, "Dirty cache entries flushed");
    }

    /// Force one entry's pending write to the store, for critical writes
    /// that must be visible before a response goes out. No-op when the
    /// entry is absent or clean.
    pub async fn flush_one<F, Fut>(&self, id: &str, write: F) -> Result<()>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let snapshot = match self.entries.get(id) {
            Some(entry) if entry.dirty => entry.session.clone(),
            _ => return Ok(()),
        };

        write(snapshot.clone()).await?;
        if let Some(mut entry) = self.entries.get_mut(id) {
            if entry.session.last_activity == snapshot.last_activity {
                entry.dirty = false;
                entry.timestamp = Instant::now();
            }
        }
        Ok(())
    }

    /// Drop clean entries that fell out of the freshness window.
    /// Dirty entries stay until the flush task writes them.
    pub fn cleanup(&self) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.dirty && entry.timestamp.elapsed() >= self.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len();
        for id in stale {
            self.entries.remove(&id);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            dirty: self.dirty_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evict least-recently-touched entries until one slot is free
    fn evict_to_capacity(&self) {
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.last_used)
                .map(|entry| entry.key().clone());

            match oldest {
                Some(id) => {
                    if self.entries.remove(&id).is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(id = %id, "Cache entry evicted");
                    }
                }
                None => break,
            }
        }
    }
}

/// Spawn a background task that periodically drops stale clean entries.
pub fn spawn_cache_cleanup_task(cache: Arc<SessionCache>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let dropped = cache.cleanup();
            if dropped > 0 {
                debug!(dropped, "Stale cache entries dropped");
            }
        }
    });
    info!(
        interval_secs = interval.as_secs(),
        "Cache cleanup task started"
    );
}
