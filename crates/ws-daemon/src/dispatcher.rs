//! Dispatcher (§4.3): the single entry point for "deliver message M to user U".

use tracing::warn;
use ws_schemas::{DeliverOutcome, NotificationRecord, ServerFrame};

use crate::state::AppState;

/// Resolve `record.user_id` via the Registry and either push it on a local
/// socket, enqueue it for later delivery, or drop it.
///
/// Mirrors §4.3's four-step algorithm: local-push-first, compare-and-delete
/// fallback on a stale local binding, enqueue-on-absence, drop-on-empty.
/// The empty-message check is scoped to the enqueue branch only (§4.3 step
/// 4 reads "`Registry.enqueueOffline(...)`. If `message` is empty →
/// Dropped" — step 2's local push has no such carve-out), so an online
/// user still gets an empty-message notification delivered to their live
/// socket; only the would-be-enqueued copy is ever dropped.
pub async fn deliver(app: &AppState, record: NotificationRecord) -> DeliverOutcome {
    let binding = match app.registry.lookup_by_user(&record.user_id).await {
        Ok(b) => b,
        Err(e) => {
            warn!(user_id = %record.user_id, error = %e, "registry lookup failed, treating as not locally live");
            None
        }
    };

    let Some(binding) = binding else {
        return enqueue(app, record).await;
    };

    if binding.server != app.server_id {
        // Owned by a peer process; we have no local socket for it.
        return enqueue(app, record).await;
    }

    let frame = notification_frame(app, &record).await;
    if app.connections.push(binding.handle, frame).await {
        return DeliverOutcome::Delivered;
    }

    // Local push failed: the session task has already exited. Evict our
    // side of the binding — the socket's own close path may already have
    // done this, so treat "already gone" as success (§4.3 step 3).
    if let Err(e) = app.registry.unbind_by_handle(&app.server_id, binding.handle).await {
        warn!(
            user_id = %record.user_id, handle = binding.handle, error = %e,
            "failed to unbind stale local handle after failed push"
        );
    }

    enqueue(app, record).await
}

/// Build the outbound `{type:"notification", ...}` frame for a record,
/// stamping `count` with the user's current total unread count (§6). A
/// count-query failure doesn't block delivery — it just sends `0`, the same
/// "non-fatal, log and continue" treatment §4.6 gives the count snapshot.
pub async fn notification_frame(app: &AppState, record: &NotificationRecord) -> ServerFrame {
    let count = ws_db::total_unread_count(&app.pools, &record.user_id)
        .await
        .unwrap_or_else(|e| {
            warn!(user_id = %record.user_id, error = %e, "unread count query failed, sending count=0");
            0
        });
    ServerFrame::Notification {
        event: record.event.clone(),
        message: record.message.clone(),
        count,
        timestamp: record.timestamp,
    }
}

/// §4.3 step 4: enqueue into the offline queue, dropping instead if
/// `message` is empty (nothing worth waking a reconnect for) or if the
/// Registry write itself fails.
async fn enqueue(app: &AppState, record: NotificationRecord) -> DeliverOutcome {
    if record.message.is_empty() {
        return DeliverOutcome::Dropped;
    }
    match app.registry.enqueue_offline(&record.user_id, &record).await {
        Ok(()) => DeliverOutcome::Queued,
        Err(e) => {
            warn!(user_id = %record.user_id, error = %e, "failed to enqueue offline notification");
            DeliverOutcome::Dropped
        }
    }
}
