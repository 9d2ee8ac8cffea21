//! Feeder B — SQL poller (§4.4).
//!
//! Every 15s, claims `pending` rows and hands each to the Dispatcher.
//! SPEC_FULL §4.4.1 adds a leader-election lock so only one server process
//! runs this poll per tick even though every process otherwise runs an
//! identical copy of this task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use ws_db::PendingNotification;
use ws_schemas::{DeliverOutcome, NotificationRecord};

use crate::dispatcher;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(15);
const LOCK_TTL: Duration = Duration::from_secs(20);
const BATCH_SIZE: i64 = 100;

/// `shutdown` fires once, at process shutdown (§5.1): releases the leader
/// lock immediately rather than making a surviving worker wait out the TTL.
pub fn spawn(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        // A per-process identity, not a connection handle — only used to
        // attribute leader-lock ownership so `renew`/`release` can tell
        // "still us" from "someone else now holds it".
        let owner = format!("{}:{}", app.server_id, Uuid::new_v4());
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        // Tracks whether *this* tick's call thinks it still holds the lock
        // from a prior tick. On the first tick after acquiring, renew
        // rather than re-acquire with `SET NX` — NX would fail against our
        // own still-live key and stall polling until the lock's TTL
        // expires (SPEC_FULL §4.4.1).
        let mut holding = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        if holding {
                            if let Err(e) = app.registry.release_leader_lock(&owner).await {
                                warn!(error = %e, "failed to release feeder B leader lock on shutdown");
                            }
                        }
                        return;
                    }
                    continue;
                }
            }

            let became_leader = if holding {
                match app.registry.renew_leader_lock(&owner, LOCK_TTL).await {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!("lost feeder B leader lock, attempting re-acquisition");
                        holding = false;
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "leader lock renewal failed, skipping this tick");
                        holding = false;
                        false
                    }
                }
            } else {
                match app.registry.try_acquire_leader_lock(&owner, LOCK_TTL).await {
                    Ok(acquired) => acquired,
                    Err(e) => {
                        warn!(error = %e, "leader lock acquisition failed, skipping this tick");
                        false
                    }
                }
            };
            holding = became_leader;
            if became_leader {
                claim_and_deliver_pending(&app).await;
            }
        }
    });
}

/// Claim a batch of `pending` rows and hand each to the Dispatcher.
///
/// This is "Feeder B's body" in the §4.4 sense: the periodic tick above
/// only calls it while holding the leader lock, but Feeder C's
/// `process_pending_db_notifications` task (§4.4 Task dispatch) also calls
/// it directly, on demand, from any worker — that's safe without the lock
/// because `claim_pending_notifications`'s `FOR UPDATE SKIP LOCKED` already
/// prevents two callers from claiming the same row, lock or no lock; the
/// leader lock only exists to stop every process from polling on the same
/// 15s cadence, not to guard correctness.
pub(crate) async fn claim_and_deliver_pending(app: &Arc<AppState>) {
    let claimed = match ws_db::claim_pending_notifications(&app.pools.write, BATCH_SIZE).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "feeder B claim_pending_notifications failed");
            return;
        }
    };

    if claimed.is_empty() {
        return;
    }
    info!(count = claimed.len(), "feeder B claimed pending notifications");

    for row in claimed {
        // `claim_pending_notifications` already filtered out rows with a
        // missing `user_id`/`message` and left them `pending` rather than
        // `sent` (§4.4) — every row here was actually claimed.
        let PendingNotification { id, user_id, event, message, created_at } = row;
        let record = NotificationRecord {
            user_id,
            event,
            message,
            timestamp: created_at,
            id: Some(id),
        };
        // The row was already flipped to `sent` by the claiming query; per
        // §4.4 that's correct for Delivered/Queued ("once in Q(U) it is
        // handled"), but a Dropped outcome means delivery genuinely did not
        // happen, so put it back for the next poll to retry.
        if dispatcher::deliver(app, record).await == DeliverOutcome::Dropped {
            if let Err(e) = ws_db::release_claim(&app.pools.write, id).await {
                warn!(id, error = %e, "failed to release claim after dropped delivery");
            }
        }
    }
}
