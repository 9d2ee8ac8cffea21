//! Feeder C — task dispatch (§4.4).
//!
//! Single-writer in-process queue for jobs issued by request handlers (the
//! `send_notification` and `mark_read` actions in §4.2's action table) plus
//! the two task kinds §4.4 names for driving the other feeders on demand:
//! `process_pending_db_notifications` and `process_queued_notifications`.
//! Each job is handled inline; a job that fails is logged and dropped
//! rather than retried — at-most-once delivery for this path matches the
//! "task items are not cancellable once accepted" language in §5, and
//! retry-by-poll is already covered by Feeder B for anything persisted.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use ws_schemas::NotificationRecord;

use crate::dispatcher;
use crate::pump::feeder_b_poller;
use crate::state::{AppState, TaskJob};

pub fn spawn(app: Arc<AppState>, mut rx: mpsc::UnboundedReceiver<TaskJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                TaskJob::SendNotification { user_id, event, message } => {
                    let record = NotificationRecord {
                        user_id,
                        event,
                        message,
                        timestamp: chrono::Utc::now(),
                        id: None,
                    };
                    dispatcher::deliver(&app, record).await;
                }
                TaskJob::MarkNotificationRead { user_id, notification_id } => {
                    match ws_db::mark_notification_read(&app.pools.write, &user_id, notification_id).await {
                        Ok(false) => {
                            warn!(user_id, notification_id, "mark_read denied: not owner or already read");
                        }
                        Err(e) => {
                            warn!(user_id, notification_id, error = %e, "mark_notification_read failed");
                        }
                        Ok(true) => {}
                    }
                }
                TaskJob::ProcessPendingDbNotifications => {
                    feeder_b_poller::claim_and_deliver_pending(&app).await;
                }
                TaskJob::ProcessQueuedNotifications { user_ids } => {
                    process_queued_notifications(&app, user_ids).await;
                }
            }
        }
    });
}

/// Drain `Q(U)` for each of `user_ids` (every active user if empty) and
/// re-attempt delivery for each record — a user may have reconnected since
/// the record was originally enqueued. Anything that still can't be
/// delivered locally is put back on the offline queue rather than dropped,
/// since these are already-accepted notifications, not fresh deliveries
/// (§4.4 Task dispatch, SPEC_FULL §4.1.1).
async fn process_queued_notifications(app: &Arc<AppState>, user_ids: Vec<String>) {
    let targets = if user_ids.is_empty() {
        match app.registry.list_active_users().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "process_queued_notifications: failed to list active users");
                return;
            }
        }
    } else {
        user_ids
    };

    for user_id in targets {
        let backlog = match app.registry.drain_offline(&user_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(user_id, error = %e, "process_queued_notifications: drain failed");
                continue;
            }
        };
        for record in backlog {
            redeliver_or_requeue(app, record).await;
        }
    }
}

/// Push straight onto the user's local socket if still bound here;
/// otherwise (peer-owned, no binding, or the local push failed) put the
/// record back in the offline queue rather than losing it.
async fn redeliver_or_requeue(app: &Arc<AppState>, record: NotificationRecord) {
    let binding = match app.registry.lookup_by_user(&record.user_id).await {
        Ok(b) => b,
        Err(e) => {
            warn!(user_id = %record.user_id, error = %e, "process_queued_notifications: lookup failed");
            None
        }
    };

    let delivered = match &binding {
        Some(b) if b.server == app.server_id => {
            let frame = dispatcher::notification_frame(app, &record).await;
            app.connections.push(b.handle, frame).await
        }
        _ => false,
    };

    if !delivered {
        if let Err(e) = app.registry.enqueue_offline(&record.user_id, &record).await {
            warn!(
                user_id = %record.user_id, error = %e,
                "process_queued_notifications: failed to re-queue undelivered record"
            );
        }
    }
}
