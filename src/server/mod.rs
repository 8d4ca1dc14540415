//! HTTP server and WebSocket connection routing

pub mod http;
pub mod websocket;

pub use http::{run, AppState};
pub use websocket::{schedule_session_cleanup, spawn_liveness_task, ConnectionTracker};
