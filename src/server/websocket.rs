//! WebSocket upgrade and connection handling
//!
//! Dispatches upgrade requests by exact pathname, runs each accepted
//! connection as a reader loop plus a writer task draining the bounded
//! outbox, and keeps connections honest with a shared liveness ping: any
//! connection that failed to answer the previous ping is terminated.
//!
//! When a socket bound to a session closes, cleanup is scheduled after a
//! short grace period rather than immediately, so a page reload does not
//! fire a spurious session-end; the timer no-ops if another connection for
//! the same session exists when it fires.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::link::PERSISTENT_HASH_LEN;
use crate::server::http::{bad_request_response, end_session, AppState};
use crate::waiting::{ClientMessage, JoinOutcome, Outbound, WaitingRoom};

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Longest accepted activity name in the query string
const MAX_ACTIVITY_NAME_LEN: usize = 64;

struct ConnectionEntry {
    outbox: mpsc::Sender<Outbound>,
    is_alive: Arc<AtomicBool>,
    session_id: Option<String>,
}

/// Registry of open WebSocket connections on this instance
pub struct ConnectionTracker {
    connections: DashMap<Uuid, ConnectionEntry>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    fn register(&self, socket_id: Uuid, outbox: mpsc::Sender<Outbound>) -> Arc<AtomicBool> {
        let is_alive = Arc::new(AtomicBool::new(true));
        self.connections.insert(
            socket_id,
            ConnectionEntry {
                outbox,
                is_alive: Arc::clone(&is_alive),
                session_id: None,
            },
        );
        is_alive
    }

    fn deregister(&self, socket_id: &Uuid) -> Option<String> {
        self.connections
            .remove(socket_id)
            .and_then(|(_, entry)| entry.session_id)
    }

    /// Associate the connection with a session so keepalives refresh it
    /// and disconnect cleanup knows what to check.
    pub fn bind_session(&self, socket_id: &Uuid, session_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(socket_id) {
            entry.session_id = Some(session_id.to_string());
        }
    }

    /// Live connections bound to a session on this instance
    pub fn session_connection_count(&self, session_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.session_id.as_deref() == Some(session_id))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ask every open connection to close (shutdown path)
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            let _ = entry.outbox.try_send(Outbound::Close);
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the shared liveness interval: terminate anything that missed the
/// previous ping, then ping everything else.
pub fn spawn_liveness_task(tracker: Arc<ConnectionTracker>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for entry in tracker.connections.iter() {
                if entry.is_alive.swap(false, Ordering::AcqRel) {
                    let _ = entry.outbox.try_send(Outbound::Ping);
                } else {
                    debug!(socket_id = %entry.key(), "Liveness ping unanswered, terminating");
                    let _ = entry.outbox.try_send(Outbound::Close);
                }
            }
        }
    });
    info!(
        interval_ms = interval.as_millis() as u64,
        "Connection liveness task started"
    );
}

/// Defer session cleanup past a reconnect grace period. No-op if another
/// connection for the session exists when the timer fires.
pub fn schedule_session_cleanup(state: Arc<AppState>, session_id: String) {
    let grace = state.args.cleanup_grace();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if state.tracker.session_connection_count(&session_id) > 0 {
            debug!(session_id = %session_id, "Cleanup skipped, session reconnected");
            return;
        }
        info!(session_id = %session_id, "No reconnect within grace period, ending session");
        end_session(&state, &session_id).await;
    });
}

/// Handle the upgrade for `/ws/persistent-session?hash=<20-hex>&activityName=<id>`
pub async fn handle_persistent_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
    addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let query = req.uri().query().unwrap_or("");
    let hash = match query_param(query, "hash") {
        Some(hash) if is_valid_hash(&hash) => hash,
        _ => return bad_request_response("hash must be 20 hex characters"),
    };
    let activity_name = match query_param(query, "activityName") {
        Some(name) if is_valid_activity_name(&name) => name,
        _ => return bad_request_response("activityName is required"),
    };

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            let client_ip = addr.ip().to_string();
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => {
                        handle_persistent_connection(state, ws, hash, activity_name, client_ip)
                            .await;
                    }
                    Err(e) => error!("WebSocket upgrade failed: {:?}", e),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!("WebSocket upgrade error: {:?}", e);
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!(
                    "WebSocket upgrade failed: {e}"
                ))))
                .unwrap()
        }
    }
}

/// Run one waiting-room connection to completion
async fn handle_persistent_connection(
    state: Arc<AppState>,
    ws: HyperWebSocket,
    hash: String,
    activity_name: String,
    client_ip: String,
) {
    let socket_id = Uuid::new_v4();
    let (mut sink, mut stream) = ws.split();
    let (outbox, mut outbox_rx) = WaitingRoom::outbox_channel();

    // Writer task: sole owner of the sink, drains the bounded outbox.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            let result = match frame {
                Outbound::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => sink.send(WsMessage::Text(json)).await,
                    Err(e) => {
                        warn!(error = %e, "Outbound message serialization failed");
                        continue;
                    }
                },
                Outbound::Ping => sink.send(WsMessage::Ping(Vec::new())).await,
                Outbound::Pong(data) => sink.send(WsMessage::Pong(data)).await,
                Outbound::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let is_alive = state.tracker.register(socket_id, outbox.clone());
    info!(socket_id = %socket_id, hash = %hash, "Waiting-room client connected");

    let joined = state
        .waiting
        .join(&hash, &activity_name, socket_id, outbox.clone())
        .await;

    let mut bound_session: Option<String> = None;
    match joined {
        Ok(JoinOutcome::AlreadyStarted { .. }) => {
            // The binding was already delivered; nothing to wait for.
            let _ = outbox.try_send(Outbound::Close);
        }
        Ok(JoinOutcome::Waiting { .. }) => {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        touch_bound_session(&state, &bound_session);
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::VerifyTeacherCode { teacher_code }) => {
                                if let Some(session_id) = state
                                    .waiting
                                    .verify_teacher_code(
                                        &hash,
                                        &activity_name,
                                        &client_ip,
                                        socket_id,
                                        &outbox,
                                        &teacher_code,
                                    )
                                    .await
                                {
                                    state.tracker.bind_session(&socket_id, &session_id);
                                    bound_session = Some(session_id);
                                }
                            }
                            Err(e) => {
                                // No client-visible error for malformed frames.
                                debug!(socket_id = %socket_id, error = %e, "Ignoring malformed message");
                            }
                        }
                    }
                    Ok(WsMessage::Ping(data)) => {
                        is_alive.store(true, Ordering::Release);
                        touch_bound_session(&state, &bound_session);
                        let _ = outbox.try_send(Outbound::Pong(data));
                    }
                    Ok(WsMessage::Pong(_)) => {
                        is_alive.store(true, Ordering::Release);
                        touch_bound_session(&state, &bound_session);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(socket_id = %socket_id, error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            warn!(hash = %hash, error = %e, "Waiting-room join failed");
            let _ = outbox.try_send(Outbound::Close);
        }
    }

    state.waiting.leave(&hash, socket_id);
    let bound = state.tracker.deregister(&socket_id);
    drop(outbox);
    let _ = writer.await;

    if let Some(session_id) = bound {
        schedule_session_cleanup(Arc::clone(&state), session_id);
    }
    info!(socket_id = %socket_id, "Waiting-room client disconnected");
}

/// Refresh the bound session's activity timestamp, fire-and-forget
fn touch_bound_session(state: &Arc<AppState>, bound_session: &Option<String>) {
    if let Some(session_id) = bound_session {
        let sessions = Arc::clone(&state.sessions);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            sessions.touch(&session_id).await;
        });
    }
}

/// Extract a query-string parameter by exact key
fn query_param(query: &str, key: &str) -> Option<String> {
    for param in query.split('&') {
        if let Some((k, value)) = param.split_once('=') {
            if k == key && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == PERSISTENT_HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_valid_activity_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ACTIVITY_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_extraction() {
        let query = "hash=0123456789abcdef0123&activityName=raffle";
        assert_eq!(
            query_param(query, "hash").as_deref(),
            Some("0123456789abcdef0123")
        );
        assert_eq!(query_param(query, "activityName").as_deref(), Some("raffle"));
        assert!(query_param(query, "missing").is_none());
        assert!(query_param("hash=", "hash").is_none());
    }

    #[test]
    fn test_hash_validation() {
        assert!(is_valid_hash("0123456789abcdef0123"));
        assert!(!is_valid_hash("0123456789abcdef012"));
        assert!(!is_valid_hash("0123456789abcdef01234"));
        assert!(!is_valid_hash("0123456789abcdefghij"));
    }

    #[test]
    fn test_activity_name_validation() {
        assert!(is_valid_activity_name("raffle"));
        assert!(is_valid_activity_name("gallery-walk"));
        assert!(is_valid_activity_name("sorting_demo2"));
        assert!(!is_valid_activity_name(""));
        assert!(!is_valid_activity_name("has space"));
        assert!(!is_valid_activity_name(&"x".repeat(MAX_ACTIVITY_NAME_LEN + 1)));
    }

    #[test]
    fn test_tracker_session_binding() {
        let tracker = ConnectionTracker::new();
        let (tx, _rx) = WaitingRoom::outbox_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.register(a, tx.clone());
        tracker.register(b, tx);

        tracker.bind_session(&a, "sess1");
        tracker.bind_session(&b, "sess1");
        assert_eq!(tracker.session_connection_count("sess1"), 2);

        assert_eq!(tracker.deregister(&a).as_deref(), Some("sess1"));
        assert_eq!(tracker.session_connection_count("sess1"), 1);
        assert_eq!(tracker.deregister(&a), None);
    }

    #[test]
    fn test_close_all_reaches_every_connection() {
        let tracker = ConnectionTracker::new();
        let (tx1, mut rx1) = WaitingRoom::outbox_channel();
        let (tx2, mut rx2) = WaitingRoom::outbox_channel();
        tracker.register(Uuid::new_v4(), tx1);
        tracker.register(Uuid::new_v4(), tx2);

        tracker.close_all();
        assert!(matches!(rx1.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(rx2.try_recv(), Ok(Outbound::Close)));
    }
}
