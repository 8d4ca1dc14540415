//! Lectern - session gateway for teacher-run classroom activities
//!
//! The persistence and coordination core of a classroom activity platform:
//! students join short-lived, teacher-run sessions over WebSockets, either
//! by session code or through a durable "persistent link" that works before
//! the session exists.
//!
//! ## Services
//!
//! - **Store**: dual-backend session store (in-memory / Valkey) behind a
//!   write-back cache
//! - **Sessions**: the public session API with per-activity normalization
//! - **Links**: stateless-verifiable persistent link hashes and their
//!   waiting-to-started lifecycle
//! - **Waiting room**: per-instance WebSocket fan-out for unstarted links
//! - **Server**: HTTP routes, upgrade dispatch, connection liveness

pub mod config;
pub mod link;
pub mod server;
pub mod session;
pub mod store;
pub mod types;
pub mod waiting;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{LecternError, Result};
