//! Valkey (Redis-protocol) backing store
//!
//! Sessions are JSON blobs at `session:<id>` with a millisecond expiry equal
//! to the TTL, refreshed on every explicit write. Anything that decides a
//! cross-instance race runs as a server-side script:
//!
//! - `touch` is a read-modify-write of `lastActivity` plus TTL renewal in
//!   one script, so concurrent touches from different instances cannot lose
//!   updates;
//! - `link_bind_session` is a compare-and-set that binds iff the link is
//!   not already started, which makes session start exactly-once per hash
//!   even when two instances authenticate simultaneously.
//!
//! Key listing uses cursor-based SCAN, never a blocking full-keyspace
//! command; it is expensive and callers must keep it off hot paths.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::link::{BindOutcome, LinkMetadata};
use crate::session::Session;
use crate::store::SessionBackend;
use crate::types::{LecternError, Result};

const SESSION_KEY_PREFIX: &str = "session:";
const LINK_KEY_PREFIX: &str = "link:";

/// Capacity of each per-channel broadcast fan-out
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Atomic lastActivity refresh + TTL renewal.
/// KEYS[1] = session key, ARGV[1] = epoch ms, ARGV[2] = ttl ms.
const TOUCH_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local session = cjson.decode(raw)
session.lastActivity = tonumber(ARGV[1])
redis.call('SET', KEYS[1], cjson.encode(session), 'PX', tonumber(ARGV[2]))
return 1
"#;

/// Compare-and-set for the waiting-to-started transition.
/// Binds iff sessionId is null; always returns the authoritative record.
/// KEYS[1] = link key, ARGV[1] = session id, ARGV[2] = teacher socket id,
/// ARGV[3] = hashed teacher code.
/// Returns {-1, ''} missing, {0, raw} already started, {1, raw} bound.
const BIND_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {-1, ''} end
local meta = cjson.decode(raw)
if meta.sessionId ~= cjson.null then return {0, raw} end
meta.sessionId = ARGV[1]
meta.teacherSocketId = ARGV[2]
if meta.hashedTeacherCode == cjson.null then
  meta.hashedTeacherCode = ARGV[3]
end
local updated = cjson.encode(meta)
redis.call('SET', KEYS[1], updated)
return {1, updated}
"#;

/// Clear the binding so the link can be reused.
/// KEYS[1] = link key. Returns 0 when no record exists.
const RESET_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local meta = cjson.decode(raw)
meta.sessionId = cjson.null
meta.teacherSocketId = cjson.null
redis.call('SET', KEYS[1], cjson.encode(meta))
return 1
"#;

/// Increment a windowed counter, arming its expiry on first increment.
/// KEYS[1] = counter key, ARGV[1] = window ms.
const INCR_EXPIRE_SCRIPT: &str = r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 then redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[1])) end
return n
"#;

fn session_key(id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

fn link_key(hash: &str) -> String {
    format!("{LINK_KEY_PREFIX}{hash}")
}

/// Valkey-backed session store
pub struct ValkeyBackend {
    client: Client,
    connection: ConnectionManager,
    touch_script: Script,
    bind_script: Script,
    reset_script: Script,
    incr_script: Script,
    /// One subscriber task per channel feeding a bounded broadcast sender
    subscriptions: DashMap<String, broadcast::Sender<String>>,
}

impl ValkeyBackend {
    /// Connect with bounded retries so startup fails fast when the store
    /// is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url, "Connecting to Valkey");

        let client = Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(2)
            .set_connection_timeout(Duration::from_secs(5));
        let connection = client
            .get_connection_manager_with_config(config)
            .await?;

        info!("Valkey connected");

        Ok(Self {
            client,
            connection,
            touch_script: Script::new(TOUCH_SCRIPT),
            bind_script: Script::new(BIND_SCRIPT),
            reset_script: Script::new(RESET_SCRIPT),
            incr_script: Script::new(INCR_EXPIRE_SCRIPT),
            subscriptions: DashMap::new(),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Cursor-scan keys matching a prefix. Expensive: one round trip per
    /// SCAN batch.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionBackend for ValkeyBackend {
    fn name(&self) -> &'static str {
        "valkey"
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.get_json(&session_key(id)).await
    }

    async fn set(&self, session: &Session, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(session)?;
        let _: () = redis::cmd("SET")
            .arg(session_key(&session.id))
            .arg(raw)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(session_key(id)).await?;
        Ok(())
    }

    async fn touch(&self, id: &str, at_ms: u64, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let touched: i64 = self
            .touch_script
            .key(session_key(id))
            .arg(at_ms)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn get_all_ids(&self) -> Result<Vec<String>> {
        let keys = self.scan_keys(SESSION_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(SESSION_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<Session>> {
        let keys = self.scan_keys(SESSION_KEY_PREFIX).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            // A key may expire between the scan and the read.
            match self.get_json::<Session>(&key).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    async fn cleanup(&self) -> Result<usize> {
        // Valkey expires session keys natively via PX.
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager has no explicit shutdown; dropping the handles
        // closes the connections. Subscriber tasks end with their streams.
        debug!("Valkey backend closed");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let tx = match self.subscriptions.entry(channel.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => return Ok(entry.get().subscribe()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
                entry.insert(tx.clone());
                tx
            }
        };
        let rx = tx.subscribe();

        let mut pubsub = match self.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                self.subscriptions.remove(channel);
                return Err(e.into());
            }
        };
        if let Err(e) = pubsub.subscribe(channel).await {
            self.subscriptions.remove(channel);
            return Err(e.into());
        }
        let channel_name = channel.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        // Receiver lag or absence is the consumer's problem,
                        // never the publisher's.
                        let _ = tx.send(payload);
                    }
                    Err(e) => warn!(channel = %channel_name, error = %e, "Bad pub/sub payload"),
                }
            }
            debug!(channel = %channel_name, "Subscriber stream ended");
        });

        Ok(rx)
    }

    async fn link_get(&self, hash: &str) -> Result<Option<LinkMetadata>> {
        self.get_json(&link_key(hash)).await
    }

    async fn link_put_if_absent(&self, hash: &str, meta: LinkMetadata) -> Result<LinkMetadata> {
        let mut conn = self.conn();
        let key = link_key(hash);
        let raw = serde_json::to_string(&meta)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(raw)
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        if created.is_some() {
            return Ok(meta);
        }
        // Lost the creation race; the stored record is authoritative.
        self.link_get(hash)
            .await?
            .ok_or_else(|| LecternError::Store(format!("link record vanished: {hash}")))
    }

    async fn link_bind_session(
        &self,
        hash: &str,
        session_id: &str,
        teacher_socket_id: &str,
        hashed_teacher_code: &str,
    ) -> Result<BindOutcome> {
        let mut conn = self.conn();
        let (state, raw): (i64, String) = self
            .bind_script
            .key(link_key(hash))
            .arg(session_id)
            .arg(teacher_socket_id)
            .arg(hashed_teacher_code)
            .invoke_async(&mut conn)
            .await?;

        match state {
            1 => Ok(BindOutcome::Bound(serde_json::from_str(&raw)?)),
            0 => {
                let meta: LinkMetadata = serde_json::from_str(&raw)?;
                let existing = meta.session_id.ok_or_else(|| {
                    LecternError::Store("started link without session id".to_string())
                })?;
                Ok(BindOutcome::AlreadyStarted(existing))
            }
            _ => Ok(BindOutcome::Missing),
        }
    }

    async fn link_reset(&self, hash: &str) -> Result<bool> {
        let mut conn = self.conn();
        let reset: i64 = self
            .reset_script
            .key(link_key(hash))
            .invoke_async(&mut conn)
            .await?;
        Ok(reset == 1)
    }

    async fn link_delete(&self, hash: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(link_key(hash)).await?;
        Ok(())
    }

    async fn link_all(&self) -> Result<Vec<(String, LinkMetadata)>> {
        let keys = self.scan_keys(LINK_KEY_PREFIX).await?;
        let mut links = Vec::with_capacity(keys.len());
        for key in keys {
            let hash = match key.strip_prefix(LINK_KEY_PREFIX) {
                Some(hash) => hash.to_string(),
                None => continue,
            };
            match self.get_json::<LinkMetadata>(&key).await {
                Ok(Some(meta)) => links.push((hash, meta)),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable link record"),
            }
        }
        Ok(links)
    }

    async fn counter_get(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = self
            .incr_script
            .key(key)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }
}
