//! Persistent links
//!
//! A persistent link is a durable URL a teacher can reuse across activity
//! runs. The link is identified by a 20-hex-char hash that is verifiable
//! from `(activityName, hash, candidateTeacherCode)` alone, so students can
//! wait on a link before any server-side state exists.

pub mod hash;
pub mod registry;

pub use hash::{
    generate_persistent_hash, hash_teacher_code, verify_teacher_code_with_hash, PersistentHash,
    Verification, PERSISTENT_HASH_LEN,
};
pub use registry::{spawn_link_gc_task, LinkRegistry};

use serde::{Deserialize, Serialize};

use crate::session::now_ms;

/// Server-side record for one persistent link, created lazily on first
/// contact with a hash.
///
/// `session_id` is non-null iff the link has been started; only the atomic
/// bind at the backing store may set it. `hashed_teacher_code` is
/// first-write-wins once a teacher has authenticated. The record is
/// reconstructible from the hash alone, so garbage-collecting an unstarted
/// record loses nothing durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMetadata {
    pub activity_name: String,
    pub hashed_teacher_code: Option<String>,
    /// Creation timestamp, epoch milliseconds
    pub created_at: u64,
    pub session_id: Option<String>,
    pub teacher_socket_id: Option<String>,
}

impl LinkMetadata {
    pub fn new(activity_name: &str) -> Self {
        Self {
            activity_name: activity_name.to_string(),
            hashed_teacher_code: None,
            created_at: now_ms(),
            session_id: None,
            teacher_socket_id: None,
        }
    }

    /// Whether the link is bound to a live session
    pub fn is_started(&self) -> bool {
        self.session_id.is_some()
    }
}

/// Result of the atomic waiting-to-started bind
#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// This caller won; the returned record carries the new binding
    Bound(LinkMetadata),
    /// Another caller already started the link with this session id
    AlreadyStarted(String),
    /// No record exists for the hash
    Missing,
}
