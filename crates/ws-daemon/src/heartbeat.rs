//! Heartbeat reaper (§4.5): a second line of defence against stale
//! connections, independent of each session's own idle timer in `ws.rs`.
//!
//! Each session already closes itself after 180s of silence (`recv_loop`'s
//! own `tokio::time::sleep`). This sweep exists for the case that timer
//! never fires — a hung or panicked session task — mirroring the
//! `heartbeat_idle_time`/`heartbeat_check_interval` pair described at the
//! transport layer in §4.5.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::state::{AppState, HEARTBEAT_IDLE_TIME};

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(app: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        let idle_threshold_millis = HEARTBEAT_IDLE_TIME.as_millis() as i64;
        loop {
            ticker.tick().await;
            for (handle, idle_millis) in app.connections.idle_snapshot().await {
                if idle_millis >= idle_threshold_millis {
                    warn!(handle, idle_millis, "reaper closing stale connection");
                    app.connections.force_close(handle, 4001, "idle timeout").await;
                }
            }
        }
    });
}
