//! Persistent link registry
//!
//! Materializes link metadata lazily, owns the waiting-to-started bind,
//! rate-limits teacher-code attempts, and garbage-collects abandoned
//! records. All state lives in the backing store; the registry itself is
//! stateless apart from the HMAC secret.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::link::{
    generate_persistent_hash, verify_teacher_code_with_hash, BindOutcome, LinkMetadata,
    PersistentHash, Verification,
};
use crate::session::now_ms;
use crate::store::SessionBackend;
use crate::types::Result;

/// Maximum failed teacher-code attempts per (ip, hash) per window
const MAX_TEACHER_CODE_ATTEMPTS: i64 = 5;

/// Sliding rate-limit window
const ATTEMPT_WINDOW: Duration = Duration::from_secs(60);

/// Unstarted, waiterless records older than this are garbage-collected
const LINK_IDLE_WINDOW_MS: u64 = 10 * 60 * 1000;

fn attempt_key(client_ip: &str, hash: &str) -> String {
    // Keyed by ip AND hash so one NAT'd classroom's failures cannot lock
    // out a different classroom sharing the hash namespace.
    format!("teacher-code:{client_ip}:{hash}")
}

/// Stateless-verifiable persistent link registry
pub struct LinkRegistry {
    backend: Arc<dyn SessionBackend>,
    secret: Vec<u8>,
    dev_mode: bool,
}

impl LinkRegistry {
    pub fn new(backend: Arc<dyn SessionBackend>, secret: String, dev_mode: bool) -> Self {
        Self {
            backend,
            secret: secret.into_bytes(),
            dev_mode,
        }
    }

    /// Mint a new persistent link hash for an activity
    pub fn generate_hash(&self, activity_name: &str, teacher_code: &str) -> PersistentHash {
        generate_persistent_hash(activity_name, teacher_code, &self.secret)
    }

    /// Verify a candidate teacher code against a hash. The caller reports
    /// only a generic failure to clients; the specific reason is logged
    /// here outside production builds only.
    pub fn verify(&self, activity_name: &str, hash: &str, candidate_code: &str) -> Verification {
        let verification =
            verify_teacher_code_with_hash(activity_name, hash, candidate_code, &self.secret);
        if !verification.valid && self.dev_mode {
            debug!(
                hash,
                activity = activity_name,
                reason = verification.error.unwrap_or("unknown"),
                "Teacher code verification failed"
            );
        }
        verification
    }

    /// Idempotently materialize the metadata record for a hash.
    /// First write wins; an existing record is never overwritten.
    pub async fn get_or_create_active(
        &self,
        hash: &str,
        activity_name: &str,
    ) -> Result<LinkMetadata> {
        if let Some(existing) = self.backend.link_get(hash).await? {
            return Ok(existing);
        }
        let meta = self
            .backend
            .link_put_if_absent(hash, LinkMetadata::new(activity_name))
            .await?;
        debug!(hash, activity = activity_name, "Link record materialized");
        Ok(meta)
    }

    /// Bind a real session to the link, exactly once. The backing store
    /// performs the check-and-set atomically; a record with a non-null
    /// session id is authoritative and is never re-bound.
    pub async fn start_persistent_session(
        &self,
        hash: &str,
        session_id: &str,
        teacher_socket_id: &str,
        hashed_teacher_code: &str,
    ) -> Result<BindOutcome> {
        let outcome = self
            .backend
            .link_bind_session(hash, session_id, teacher_socket_id, hashed_teacher_code)
            .await?;
        match &outcome {
            BindOutcome::Bound(_) => info!(hash, session_id, "Persistent link started"),
            BindOutcome::AlreadyStarted(existing) => {
                debug!(hash, existing = %existing, "Bind lost to an existing session")
            }
            BindOutcome::Missing => warn!(hash, "Bind attempted on a missing link record"),
        }
        Ok(outcome)
    }

    /// Clear the session binding so the link can be reused. The caller is
    /// responsible for notifying local waiters with `session-ended`.
    pub async fn reset_persistent_session(&self, hash: &str) -> Result<bool> {
        let reset = self.backend.link_reset(hash).await?;
        if reset {
            info!(hash, "Persistent link reset for reuse");
        }
        Ok(reset)
    }

    /// Find the hash bound to a session id, if any. Linear scan over the
    /// record set; fine for the rare session-end path, never for hot paths.
    pub async fn find_by_session(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self
            .backend
            .link_all()
            .await?
            .into_iter()
            .find(|(_, meta)| meta.session_id.as_deref() == Some(session_id))
            .map(|(hash, _)| hash))
    }

    /// Whether another teacher-code attempt is allowed for this (ip, hash).
    /// Backend failures degrade to allowing the attempt; rate limiting is
    /// protection, not authentication.
    pub async fn can_attempt_teacher_code(&self, client_ip: &str, hash: &str) -> bool {
        match self.backend.counter_get(&attempt_key(client_ip, hash)).await {
            Ok(count) => count < MAX_TEACHER_CODE_ATTEMPTS,
            Err(e) => {
                warn!(error = %e, "Rate-limit read failed, allowing attempt");
                true
            }
        }
    }

    /// Record a failed teacher-code attempt
    pub async fn record_teacher_code_attempt(&self, client_ip: &str, hash: &str) {
        if let Err(e) = self
            .backend
            .incr_with_expiry(&attempt_key(client_ip, hash), ATTEMPT_WINDOW)
            .await
        {
            warn!(error = %e, "Rate-limit increment failed");
        }
    }

    /// One GC sweep: delete unstarted records with no local waiters that
    /// are older than the idle window. Returns the number deleted.
    pub async fn sweep_idle_links<F>(&self, local_waiter_count: F) -> Result<usize>
    where
        F: Fn(&str) -> usize,
    {
        let now = now_ms();
        let mut deleted = 0usize;
        for (hash, meta) in self.backend.link_all().await? {
            if meta.is_started() {
                continue;
            }
            if local_waiter_count(&hash) > 0 {
                continue;
            }
            if now.saturating_sub(meta.created_at) > LINK_IDLE_WINDOW_MS {
                self.backend.link_delete(&hash).await?;
                deleted += 1;
                debug!(hash = %hash, "Idle link record garbage-collected");
            }
        }
        Ok(deleted)
    }
}

/// Spawn the periodic idle-link sweep. `local_waiter_count` reports how
/// many sockets are waiting on a hash on this instance.
pub fn spawn_link_gc_task<F>(
    registry: Arc<LinkRegistry>,
    interval: Duration,
    local_waiter_count: F,
) where
    F: Fn(&str) -> usize + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match registry.sweep_idle_links(&local_waiter_count).await {
                Ok(0) => {}
                Ok(deleted) => debug!(deleted, "Idle link records deleted"),
                Err(e) => warn!(error = %e, "Link GC sweep failed"),
            }
        }
    });
    info!(
        interval_secs = interval.as_secs(),
        "Persistent link GC task started"
    );
}
