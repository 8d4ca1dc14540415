//! HTTP server implementation
//!
//! hyper http1 accept loop with TokioIo, a `match (method, path)` router,
//! and the graceful shutdown drain: stop accepting, close sockets, flush
//! dirty cache entries, close the backing store, bounded by a hard timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::link::{spawn_link_gc_task, LinkRegistry};
use crate::session::{
    spawn_flush_task, SessionEndedSignal, SessionService,
};
use crate::server::websocket::{
    handle_persistent_upgrade, spawn_liveness_task, ConnectionTracker,
};
use crate::store::{
    spawn_cache_cleanup_task, spawn_store_cleanup_task, SessionBackend, SessionCache,
};
use crate::types::LecternError;
use crate::waiting::WaitingRoom;

/// Cadence of the idle-link GC sweep
const LINK_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the store janitor (in-memory TTL reaping)
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Hard deadline for the shutdown drain before the process is forced out
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Shared application state, constructed once in `main` and injected into
/// every handler. No module-level singletons.
pub struct AppState {
    pub args: Args,
    pub backend: Arc<dyn SessionBackend>,
    pub sessions: Arc<SessionService>,
    pub links: Arc<LinkRegistry>,
    pub waiting: Arc<WaitingRoom>,
    pub tracker: Arc<ConnectionTracker>,
}

impl AppState {
    pub fn new(args: Args, backend: Arc<dyn SessionBackend>) -> Self {
        let cache = SessionCache::new(args.cache_max_entries, args.cache_ttl());
        let sessions = Arc::new(SessionService::new(
            Arc::clone(&backend),
            cache,
            args.session_ttl(),
        ));
        let links = Arc::new(LinkRegistry::new(
            Arc::clone(&backend),
            args.persistent_session_secret(),
            args.dev_mode,
        ));
        let waiting = Arc::new(WaitingRoom::new(
            Arc::clone(&sessions),
            Arc::clone(&links),
        ));

        Self {
            args,
            backend,
            sessions,
            links,
            waiting,
            tracker: Arc::new(ConnectionTracker::new()),
        }
    }
}

/// Start the HTTP server and run until SIGINT
pub async fn run(state: Arc<AppState>) -> Result<(), LecternError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Lectern listening on {} as node {} ({} backend)",
        state.args.listen,
        state.args.node_id,
        state.backend.name()
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - insecure secret fallback allowed");
    }

    spawn_flush_task(Arc::clone(&state.sessions), state.args.cache_flush_interval());
    spawn_cache_cleanup_task(state.sessions.cache_handle(), state.args.cache_ttl());
    spawn_store_cleanup_task(Arc::clone(&state.backend), STORE_CLEANUP_INTERVAL);
    spawn_liveness_task(Arc::clone(&state.tracker), state.args.ws_ping_interval());

    {
        let waiting = Arc::clone(&state.waiting);
        spawn_link_gc_task(Arc::clone(&state.links), LINK_GC_INTERVAL, move |hash| {
            waiting.waiter_count(hash)
        });
    }

    spawn_session_ended_listener(Arc::clone(&state)).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move { handle_request(state, addr, req).await }
                            });

                            if let Err(err) = http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("Error serving connection from {}: {:?}", addr, err);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {:?}", e);
                    }
                }
            }
        }
    }

    shutdown(state).await;
    Ok(())
}

/// Drain in order: close sockets, flush dirty cache entries, close the
/// store. A stalled drain forces process exit at the deadline.
async fn shutdown(state: Arc<AppState>) {
    info!("Draining: closing sockets, flushing cache, closing store");
    state.tracker.close_all();

    let drain = async {
        // Give writer tasks a moment to emit their close frames.
        tokio::time::sleep(Duration::from_millis(250)).await;
        state.sessions.flush_touches().await;
        if let Err(e) = state.backend.close().await {
            warn!(error = %e, "Backend close failed");
        }
    };

    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        error!("Graceful shutdown stalled, forcing exit");
        std::process::exit(1);
    }
    info!("Shutdown complete");
}

/// End a session: broadcast the end, reset any bound persistent link,
/// then delete. Shared by the DELETE route and disconnect cleanup.
pub(crate) async fn end_session(state: &Arc<AppState>, session_id: &str) {
    let hash = match state.links.find_by_session(session_id).await {
        Ok(hash) => hash,
        Err(e) => {
            warn!(session_id, error = %e, "Bound link lookup failed");
            None
        }
    };

    state
        .sessions
        .publish_session_ended(&SessionEndedSignal {
            node_id: state.args.node_id.to_string(),
            session_id: session_id.to_string(),
            hash: hash.clone(),
        })
        .await;

    if let Some(hash) = &hash {
        state.waiting.notify_session_ended(hash);
        if let Err(e) = state.links.reset_persistent_session(hash).await {
            warn!(hash = %hash, error = %e, "Persistent link reset failed");
        }
    }

    if let Err(e) = state.sessions.delete(session_id).await {
        warn!(session_id, error = %e, "Session delete failed");
    }
}

/// React to session ends initiated by other instances
async fn spawn_session_ended_listener(state: Arc<AppState>) {
    let mut rx = match state.sessions.subscribe_session_ended().await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "session-ended subscription failed");
            return;
        }
    };

    tokio::spawn(async move {
        let own_node = state.args.node_id.to_string();
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let signal: SessionEndedSignal = match serde_json::from_str(&payload) {
                        Ok(signal) => signal,
                        Err(e) => {
                            warn!(error = %e, "Bad session-ended payload");
                            continue;
                        }
                    };
                    if signal.node_id == own_node {
                        continue;
                    }
                    debug!(session_id = %signal.session_id, "Remote session end received");
                    if let Some(hash) = signal.hash {
                        state.waiting.notify_session_ended(&hash);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session-ended listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "backend": state.backend.name(),
                "connections": state.tracker.connection_count(),
            }),
        ),

        // Waiting-room WebSocket for persistent links (exact pathname)
        (Method::GET, "/ws/persistent-session") => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                return Ok(handle_persistent_upgrade(state, req, addr).await);
            }
            bad_request_response("WebSocket upgrade required for /ws/persistent-session")
        }

        // Unmatched upgrade paths: refuse so the socket is destroyed
        (Method::GET, p) if hyper_tungstenite::is_upgrade_request(&req) => {
            warn!(path = p, "Upgrade request on unknown path");
            not_found_response(p)
        }

        (Method::GET, p) if p.starts_with("/api/session/") => {
            let id = p.strip_prefix("/api/session/").unwrap_or("");
            handle_get_session(&state, id).await
        }

        (Method::DELETE, p) if p.starts_with("/api/session/") => {
            let id = p.strip_prefix("/api/session/").unwrap_or("");
            handle_delete_session(&state, id).await
        }

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        (_, p) => not_found_response(p),
    };

    Ok(response)
}

async fn handle_get_session(state: &Arc<AppState>, id: &str) -> Response<Full<Bytes>> {
    if id.is_empty() {
        return bad_request_response("session id required");
    }
    match state.sessions.get(id).await {
        Some(session) => match serde_json::to_value(&session) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!(id, error = %e, "Session serialization failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },
        None => error_response(StatusCode::NOT_FOUND, "session not found"),
    }
}

async fn handle_delete_session(state: &Arc<AppState>, id: &str) -> Response<Full<Bytes>> {
    if id.is_empty() {
        return bad_request_response("session id required");
    }
    if state.sessions.get(id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "session not found");
    }
    end_session(state, id).await;
    json_response(StatusCode::OK, serde_json::json!({ "deleted": id }))
}

// ============================================================================
// Response helpers
// ============================================================================

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message }))
}

pub(crate) fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": "not found", "path": path }),
    )
}

fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
        .body(Full::new(Bytes::new()))
        .unwrap()
}
