//! Waiting room for unstarted persistent links
//!
//! Per-hash, instance-local fan-out for sockets waiting on a link that has
//! no live session yet. States per hash: Idle (no sockets) → Waiting
//! (≥1 socket, unstarted) → Started (session bound) → back to Waiting/Idle
//! after reset. Waiters are never persisted: pub/sub cannot carry socket
//! handles across processes, so every instance keeps its own list.
//!
//! Each connection owns a bounded outbox drained by its writer task; the
//! coordinator fans out by cloning senders. A slow consumer drops frames
//! instead of back-pressuring whoever is broadcasting.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::link::{hash_teacher_code, BindOutcome, LinkRegistry};
use crate::session::SessionService;
use crate::types::Result;

/// Upper bound on submitted teacher codes, to bound verification cost
pub const MAX_TEACHER_CODE_LEN: usize = 100;

/// Outbox capacity per connection
const OUTBOX_CAPACITY: usize = 32;

/// Generic client-facing rejection for any verification failure
const GENERIC_CODE_ERROR: &str = "Invalid teacher code";

/// Distinct rejection so rate-limited clients can back off
const RATE_LIMITED_ERROR: &str = "Too many attempts. Try again in a minute.";

/// Frame pushed into a connection's outbox
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    /// Liveness probe issued by the shared ping interval
    Ping,
    Pong(Vec<u8>),
    Close,
}

/// Messages sent to waiting-room clients
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    WaiterCount { count: usize },
    SessionStarted { session_id: String },
    SessionEnded,
    TeacherAuthenticated { session_id: String },
    TeacherCodeError { error: String },
}

/// Messages received from waiting-room clients
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    VerifyTeacherCode { teacher_code: String },
}

struct Waiter {
    socket_id: Uuid,
    outbox: mpsc::Sender<Outbound>,
}

/// Outcome of a socket joining a hash's room
#[derive(Debug)]
pub enum JoinOutcome {
    /// Registered as a waiter; `count` includes the new socket
    Waiting { count: usize },
    /// The link is already started: the socket gets the binding and closes
    AlreadyStarted { session_id: String },
}

/// Instance-local waiting-room coordinator
pub struct WaitingRoom {
    rooms: DashMap<String, Vec<Waiter>>,
    sessions: Arc<SessionService>,
    links: Arc<LinkRegistry>,
}

impl WaitingRoom {
    pub fn new(sessions: Arc<SessionService>, links: Arc<LinkRegistry>) -> Self {
        Self {
            rooms: DashMap::new(),
            sessions,
            links,
        }
    }

    pub fn outbox_channel() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(OUTBOX_CAPACITY)
    }

    /// Live waiters for a hash on this instance
    pub fn waiter_count(&self, hash: &str) -> usize {
        self.rooms.get(hash).map(|room| room.len()).unwrap_or(0)
    }

    /// Register a socket on a hash. Started links answer immediately;
    /// otherwise the socket becomes a waiter and every waiter in the room
    /// (the new one included) gets the refreshed count.
    pub async fn join(
        &self,
        hash: &str,
        activity_name: &str,
        socket_id: Uuid,
        outbox: mpsc::Sender<Outbound>,
    ) -> Result<JoinOutcome> {
        let meta = self.links.get_or_create_active(hash, activity_name).await?;
        if let Some(session_id) = meta.session_id {
            send(&outbox, ServerMessage::SessionStarted { session_id: session_id.clone() });
            return Ok(JoinOutcome::AlreadyStarted { session_id });
        }

        let count = {
            let mut room = self.rooms.entry(hash.to_string()).or_default();
            room.push(Waiter { socket_id, outbox });
            room.len()
        };
        debug!(hash, count, "Waiter joined");
        self.broadcast_count(hash);
        Ok(JoinOutcome::Waiting { count })
    }

    /// Remove a socket from a hash's room. Broadcasts the refreshed count
    /// only if a waiter was actually removed, so the just-authenticated
    /// teacher's own close cannot trigger a duplicate broadcast.
    pub fn leave(&self, hash: &str, socket_id: Uuid) {
        let removed = match self.rooms.get_mut(hash) {
            Some(mut room) => {
                let before = room.len();
                room.retain(|w| w.socket_id != socket_id);
                before != room.len()
            }
            None => false,
        };

        if removed {
            self.remove_room_if_empty(hash);
            debug!(hash, "Waiter left");
            self.broadcast_count(hash);
        }
    }

    /// Handle a submitted teacher code. Returns the bound session id when
    /// this socket became the teacher. All client feedback goes through
    /// the socket's outbox; errors never propagate to the transport layer.
    pub async fn verify_teacher_code(
        &self,
        hash: &str,
        activity_name: &str,
        client_ip: &str,
        socket_id: Uuid,
        outbox: &mpsc::Sender<Outbound>,
        teacher_code: &str,
    ) -> Option<String> {
        if teacher_code.is_empty() || teacher_code.len() > MAX_TEACHER_CODE_LEN {
            send_error(outbox, GENERIC_CODE_ERROR);
            return None;
        }

        if !self.links.can_attempt_teacher_code(client_ip, hash).await {
            send_error(outbox, RATE_LIMITED_ERROR);
            return None;
        }

        let verification = self.links.verify(activity_name, hash, teacher_code);
        if !verification.valid {
            self.links
                .record_teacher_code_attempt(client_ip, hash)
                .await;
            send_error(outbox, GENERIC_CODE_ERROR);
            return None;
        }

        // Create the session first, then let the atomic bind decide the
        // winner; a losing racer deletes its orphan and observes the
        // existing binding.
        let session = match self
            .sessions
            .create_session(Some(activity_name.to_string()), Map::new())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(hash, error = %e, "Session creation failed");
                send_error(outbox, GENERIC_CODE_ERROR);
                return None;
            }
        };

        let hashed = hash_teacher_code(teacher_code);
        match self
            .links
            .start_persistent_session(hash, &session.id, &socket_id.to_string(), &hashed)
            .await
        {
            Ok(BindOutcome::Bound(_)) => {
                self.notify_started(hash, socket_id, outbox, &session.id);
                Some(session.id)
            }
            Ok(BindOutcome::AlreadyStarted(existing)) => {
                self.discard_orphan(&session.id).await;
                send(
                    outbox,
                    ServerMessage::SessionStarted {
                        session_id: existing,
                    },
                );
                None
            }
            Ok(BindOutcome::Missing) => {
                self.discard_orphan(&session.id).await;
                warn!(hash, "Link record missing at bind time");
                send_error(outbox, GENERIC_CODE_ERROR);
                None
            }
            Err(e) => {
                self.discard_orphan(&session.id).await;
                warn!(hash, error = %e, "Persistent session start failed");
                send_error(outbox, GENERIC_CODE_ERROR);
                None
            }
        }
    }

    /// Announce a session end to every local waiter on the hash
    pub fn notify_session_ended(&self, hash: &str) {
        if let Some(room) = self.rooms.get(hash) {
            for waiter in room.iter() {
                send(&waiter.outbox, ServerMessage::SessionEnded);
            }
        }
        info!(hash, "Local waiters notified of session end");
    }

    /// Flip the room to started: pull the teacher out of the waiter list
    /// before any message goes out, tell the teacher first, then the rest.
    fn notify_started(
        &self,
        hash: &str,
        teacher_socket_id: Uuid,
        teacher_outbox: &mpsc::Sender<Outbound>,
        session_id: &str,
    ) {
        // Removing the teacher first keeps its own close handler from
        // firing a stale waiter-count broadcast afterwards.
        if let Some(mut room) = self.rooms.get_mut(hash) {
            room.retain(|w| w.socket_id != teacher_socket_id);
        }

        send(
            teacher_outbox,
            ServerMessage::TeacherAuthenticated {
                session_id: session_id.to_string(),
            },
        );

        if let Some(room) = self.rooms.get(hash) {
            for waiter in room.iter() {
                send(
                    &waiter.outbox,
                    ServerMessage::SessionStarted {
                        session_id: session_id.to_string(),
                    },
                );
            }
        }
        info!(hash, session_id, "Waiting room started");
    }

    fn broadcast_count(&self, hash: &str) {
        if let Some(room) = self.rooms.get(hash) {
            let count = room.len();
            for waiter in room.iter() {
                send(&waiter.outbox, ServerMessage::WaiterCount { count });
            }
        }
    }

    fn remove_room_if_empty(&self, hash: &str) {
        self.rooms.remove_if(hash, |_, room| room.is_empty());
    }

    async fn discard_orphan(&self, session_id: &str) {
        if let Err(e) = self.sessions.delete(session_id).await {
            warn!(session_id, error = %e, "Orphan session cleanup failed");
        }
    }
}

fn send(outbox: &mpsc::Sender<Outbound>, msg: ServerMessage) {
    if outbox.try_send(Outbound::Message(msg)).is_err() {
        debug!("Dropping frame for slow or closed consumer");
    }
}

fn send_error(outbox: &mpsc::Sender<Outbound>, error: &str) {
    send(
        outbox,
        ServerMessage::TeacherCodeError {
            error: error.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, SessionBackend, SessionCache};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    const SECRET: &str = "unit-test-secret-key-of-decent-length";

    fn fixture() -> (Arc<WaitingRoom>, Arc<LinkRegistry>) {
        let ttl = Duration::from_secs(60);
        let backend: Arc<dyn SessionBackend> = Arc::new(MemoryBackend::new(ttl));
        let sessions = Arc::new(SessionService::new(
            Arc::clone(&backend),
            SessionCache::new(100, Duration::from_secs(10)),
            ttl,
        ));
        let links = Arc::new(LinkRegistry::new(backend, SECRET.to_string(), true));
        (
            Arc::new(WaitingRoom::new(sessions, Arc::clone(&links))),
            links,
        )
    }

    fn drain(rx: &mut Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Message(msg) = frame {
                messages.push(msg);
            }
        }
        messages
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(ServerMessage::WaiterCount { count: 3 }).unwrap();
        assert_eq!(json["type"], "waiter-count");
        assert_eq!(json["count"], 3);

        let json = serde_json::to_value(ServerMessage::TeacherAuthenticated {
            session_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "teacher-authenticated");
        assert_eq!(json["sessionId"], "abc");

        let parsed: ClientMessage = serde_json::from_str(
            r#"{"type":"verify-teacher-code","teacherCode":"mysecret1"}"#,
        )
        .unwrap();
        let ClientMessage::VerifyTeacherCode { teacher_code } = parsed;
        assert_eq!(teacher_code, "mysecret1");
    }

    #[tokio::test]
    async fn test_join_broadcasts_count() {
        let (room, links) = fixture();
        let minted = links.generate_hash("raffle", "mysecret1");

        let (tx1, mut rx1) = WaitingRoom::outbox_channel();
        let outcome = room
            .join(&minted.hash, "raffle", Uuid::new_v4(), tx1)
            .await
            .unwrap();
        assert!(matches!(outcome, JoinOutcome::Waiting { count: 1 }));
        assert_eq!(
            drain(&mut rx1),
            vec![ServerMessage::WaiterCount { count: 1 }]
        );

        let (tx2, mut rx2) = WaitingRoom::outbox_channel();
        room.join(&minted.hash, "raffle", Uuid::new_v4(), tx2)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx1),
            vec![ServerMessage::WaiterCount { count: 2 }]
        );
        assert_eq!(
            drain(&mut rx2),
            vec![ServerMessage::WaiterCount { count: 2 }]
        );
    }

    #[tokio::test]
    async fn test_full_scenario_wrong_then_right_code() {
        let (room, links) = fixture();
        let minted = links.generate_hash("raffle", "mysecret1");

        let (student_tx, mut student_rx) = WaitingRoom::outbox_channel();
        let student_id = Uuid::new_v4();
        room.join(&minted.hash, "raffle", student_id, student_tx)
            .await
            .unwrap();

        let (teacher_tx, mut teacher_rx) = WaitingRoom::outbox_channel();
        let teacher_id = Uuid::new_v4();
        room.join(&minted.hash, "raffle", teacher_id, teacher_tx.clone())
            .await
            .unwrap();
        drain(&mut student_rx);
        drain(&mut teacher_rx);

        // Wrong code: generic error, nothing starts.
        let bound = room
            .verify_teacher_code(
                &minted.hash,
                "raffle",
                "1.2.3.4",
                teacher_id,
                &teacher_tx,
                "nope",
            )
            .await;
        assert!(bound.is_none());
        assert_eq!(
            drain(&mut teacher_rx),
            vec![ServerMessage::TeacherCodeError {
                error: "Invalid teacher code".to_string()
            }]
        );
        assert!(drain(&mut student_rx).is_empty());

        // Right code: teacher authenticated, student gets the same id.
        let bound = room
            .verify_teacher_code(
                &minted.hash,
                "raffle",
                "1.2.3.4",
                teacher_id,
                &teacher_tx,
                "mysecret1",
            )
            .await;
        let session_id = bound.expect("teacher should bind the session");

        assert_eq!(
            drain(&mut teacher_rx),
            vec![ServerMessage::TeacherAuthenticated {
                session_id: session_id.clone()
            }]
        );
        assert_eq!(
            drain(&mut student_rx),
            vec![ServerMessage::SessionStarted { session_id }]
        );

        // The teacher is no longer a waiter, so its close must not
        // re-broadcast a count to the student.
        room.leave(&minted.hash, teacher_id);
        assert!(drain(&mut student_rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_after_start_observes_binding() {
        let (room, links) = fixture();
        let minted = links.generate_hash("raffle", "mysecret1");

        let (teacher_tx, _teacher_rx) = WaitingRoom::outbox_channel();
        let teacher_id = Uuid::new_v4();
        room.join(&minted.hash, "raffle", teacher_id, teacher_tx.clone())
            .await
            .unwrap();
        let session_id = room
            .verify_teacher_code(
                &minted.hash,
                "raffle",
                "1.2.3.4",
                teacher_id,
                &teacher_tx,
                "mysecret1",
            )
            .await
            .unwrap();

        let (late_tx, mut late_rx) = WaitingRoom::outbox_channel();
        let outcome = room
            .join(&minted.hash, "raffle", Uuid::new_v4(), late_tx)
            .await
            .unwrap();
        assert!(matches!(outcome, JoinOutcome::AlreadyStarted { .. }));
        assert_eq!(
            drain(&mut late_rx),
            vec![ServerMessage::SessionStarted { session_id }]
        );
    }

    #[tokio::test]
    async fn test_rate_limit_rejected_distinctly() {
        let (room, links) = fixture();
        let minted = links.generate_hash("raffle", "mysecret1");

        let (tx, mut rx) = WaitingRoom::outbox_channel();
        let socket_id = Uuid::new_v4();
        room.join(&minted.hash, "raffle", socket_id, tx.clone())
            .await
            .unwrap();
        drain(&mut rx);

        for _ in 0..5 {
            room.verify_teacher_code(&minted.hash, "raffle", "1.2.3.4", socket_id, &tx, "nope")
                .await;
        }
        drain(&mut rx);

        // Sixth attempt is rejected before verification, with the distinct
        // back-off error, even with the correct code.
        let bound = room
            .verify_teacher_code(
                &minted.hash,
                "raffle",
                "1.2.3.4",
                socket_id,
                &tx,
                "mysecret1",
            )
            .await;
        assert!(bound.is_none());
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::TeacherCodeError {
                error: "Too many attempts. Try again in a minute.".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_oversized_code_rejected() {
        let (room, links) = fixture();
        let minted = links.generate_hash("raffle", "mysecret1");
        let (tx, mut rx) = WaitingRoom::outbox_channel();
        let socket_id = Uuid::new_v4();
        room.join(&minted.hash, "raffle", socket_id, tx.clone())
            .await
            .unwrap();
        drain(&mut rx);

        let oversized = "x".repeat(MAX_TEACHER_CODE_LEN + 1);
        let bound = room
            .verify_teacher_code(&minted.hash, "raffle", "1.2.3.4", socket_id, &tx, &oversized)
            .await;
        assert!(bound.is_none());
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::TeacherCodeError {
                error: "Invalid teacher code".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (room, links) = fixture();
        let minted = links.generate_hash("raffle", "mysecret1");

        let (tx1, mut rx1) = WaitingRoom::outbox_channel();
        let id1 = Uuid::new_v4();
        room.join(&minted.hash, "raffle", id1, tx1).await.unwrap();
        let (tx2, mut rx2) = WaitingRoom::outbox_channel();
        let id2 = Uuid::new_v4();
        room.join(&minted.hash, "raffle", id2, tx2).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        room.leave(&minted.hash, id1);
        assert_eq!(
            drain(&mut rx2),
            vec![ServerMessage::WaiterCount { count: 1 }]
        );

        // Second leave for the same socket changes nothing.
        room.leave(&minted.hash, id1);
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(room.waiter_count(&minted.hash), 1);
    }
}
