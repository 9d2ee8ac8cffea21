//! Initial-State Responder (§4.6): the two frames sent on a successful open.

use ws_schemas::{NotificationCounts, ServerFrame};

use crate::state::AppState;

/// `{type:"connection", status:"connected", message, connection_id}` (§6) —
/// always succeeds, it carries no I/O.
pub fn connection_ack(handle: i64) -> ServerFrame {
    ServerFrame::Connection {
        status: "connected",
        message: "WebSocket connection established",
        connection_id: handle,
    }
}

/// `{type:"notification_count", data:{...}}`, derived from three SQL
/// queries (§4.6). Any failure here is caught and logged by the caller; the
/// connection stays live with a zeroed snapshot rather than closing.
pub async fn notification_count_frame(app: &AppState, user_id: &str) -> ServerFrame {
    let counts = ws_db::notification_counts_for_user(&app.pools, user_id)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(user_id, error = %e, "notification count snapshot failed, sending zeroed snapshot");
            NotificationCounts::default()
        });
    ServerFrame::NotificationCount(counts)
}
