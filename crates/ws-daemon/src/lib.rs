//! ws-daemon library surface.
//!
//! `main.rs` is intentionally thin: it resolves configuration, builds shared
//! state, spawns background feeders, and starts the HTTP/WebSocket server.
//! All other logic lives in these modules so the in-process router tests in
//! `tests/` can exercise it without a bound TCP socket.

pub mod dispatcher;
pub mod heartbeat;
pub mod initial_state;
pub mod pump;
pub mod routes;
pub mod state;
pub mod ws;
