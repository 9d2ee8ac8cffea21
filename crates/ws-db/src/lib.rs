//! Postgres persistence layer (§5, §6).
//!
//! The core depends on exactly two tables: `notifications` (Feeder B's
//! source of pending rows, and the read/unread counters behind the
//! Initial-State Responder) and `notices`/`notice_dismissals` (active
//! announcements, §4.6). Everything else a real deployment needs — user
//! accounts, auth — lives outside this crate's concern.
//!
//! Read and write traffic go through separate pools (§5), sized by
//! `DB_READ_POOL_SIZE`/`DB_WRITE_POOL_SIZE` (default 15/5).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use ws_schemas::{NotificationCounts, NotificationRecord};

/// The two pools the daemon holds for the lifetime of the process.
#[derive(Clone)]
pub struct PgPools {
    pub read: PgPool,
    pub write: PgPool,
}

impl PgPools {
    pub async fn connect(cfg: &ws_config::DbConfig) -> Result<Self> {
        let read = PgPoolOptions::new()
            .max_connections(cfg.read_pool_size)
            .connect(&cfg.read_url)
            .await
            .context("failed to connect read pool to Postgres")?;
        let write = PgPoolOptions::new()
            .max_connections(cfg.write_pool_size)
            .connect(&cfg.write_url)
            .await
            .context("failed to connect write pool to Postgres")?;
        Ok(Self { read, write })
    }

    /// Run embedded migrations against the write pool.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.write)
            .await
            .context("db migrate failed")?;
        Ok(())
    }
}

/// A claimed `notifications` row, ready for the Dispatcher (§4.3, §4.4).
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub id: i64,
    pub user_id: String,
    pub event: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<PendingNotification> for NotificationRecord {
    fn from(row: PendingNotification) -> Self {
        NotificationRecord {
            user_id: row.user_id,
            event: row.event,
            message: row.message,
            timestamp: row.created_at,
            id: Some(row.id),
        }
    }
}

/// Claim up to `batch_size` `pending` rows for this feeder instance,
/// flipping only the ones with a usable `user_id`/`message` to `sent`.
///
/// Runs as a transaction rather than a single `UPDATE ... RETURNING`: the
/// row lock taken by the `SELECT ... FOR UPDATE SKIP LOCKED` is held across
/// both statements, so concurrent pollers still can't double-claim a row,
/// but a row with a missing `user_id`/`message` is released back to
/// `pending` untouched instead of being marked `sent` before anyone has
/// looked at its fields (§4.4 "Rows with missing fields are skipped with a
/// warning, not marked sent"). Returns an empty `Vec` if nothing is pending.
pub async fn claim_pending_notifications(
    pool: &PgPool,
    batch_size: i64,
) -> Result<Vec<PendingNotification>> {
    let mut tx = pool
        .begin()
        .await
        .context("claim_pending_notifications: begin failed")?;

    let candidates = sqlx::query(
        r#"
        select id, user_id, event, message, created_at
        from notifications
        where status = 'pending'
        order by id asc
        limit $1
        for update skip locked
        "#,
    )
    .bind(batch_size)
    .fetch_all(&mut *tx)
    .await
    .context("claim_pending_notifications: select failed")?;

    let mut out = Vec::with_capacity(candidates.len());
    let mut sendable_ids = Vec::with_capacity(candidates.len());
    for row in candidates {
        let id: i64 = row.try_get("id")?;
        let user_id: String = row.try_get("user_id")?;
        let event: String = row.try_get("event")?;
        let message: String = row.try_get("message")?;
        let created_at = row.try_get("created_at")?;

        if user_id.is_empty() || message.is_empty() {
            tracing::warn!(id, "skipping pending notification with missing user_id/message, leaving pending");
            continue;
        }
        sendable_ids.push(id);
        out.push(PendingNotification {
            id,
            user_id,
            event,
            message,
            created_at,
        });
    }

    if !sendable_ids.is_empty() {
        sqlx::query("update notifications set status = 'sent', sent_at = now() where id = any($1)")
            .bind(&sendable_ids)
            .execute(&mut *tx)
            .await
            .context("claim_pending_notifications: update failed")?;
    }

    tx.commit()
        .await
        .context("claim_pending_notifications: commit failed")?;

    Ok(out)
}

/// Revert a claimed row back to `pending`.
///
/// Called when the Dispatcher could not even queue the notification (§7
/// "Registry fault" — delivery becomes Dropped) and the row should be
/// retried on the next poll rather than silently lost.
pub async fn release_claim(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("update notifications set status = 'pending', sent_at = null where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("release_claim failed")?;
    Ok(())
}

/// Insert a new notification directly in `pending` state — the path used by
/// Feeder C (in-process task queue, §4.4) for notifications synthesized by
/// a request handler (e.g. `send_notification`, §4.2 action table) rather
/// than discovered by the poller.
pub async fn insert_pending(pool: &PgPool, user_id: &str, event: &str, message: &str) -> Result<i64> {
    let row = sqlx::query("insert into notifications (user_id, event, message) values ($1, $2, $3) returning id")
        .bind(user_id)
        .bind(event)
        .bind(message)
        .fetch_one(pool)
        .await
        .context("insert_pending failed")?;
    row.try_get("id").context("insert_pending missing id")
}

/// Unread counts by category, plus the count of active un-dismissed
/// notices, for the Initial-State Responder (§4.6).
///
/// The read pool is used here; per §7 it falls back to the write pool once
/// on failure before giving up.
pub async fn notification_counts_for_user(pools: &PgPools, user_id: &str) -> Result<NotificationCounts> {
    match counts_query(&pools.read, user_id).await {
        Ok(c) => Ok(c),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "read pool failed for notification counts, retrying on write pool");
            counts_query(&pools.write, user_id).await
        }
    }
}

async fn counts_query(pool: &PgPool, user_id: &str) -> Result<NotificationCounts> {
    let row = sqlx::query(
        r#"
        select
            count(*) filter (where category = 'system')   as system_notifications,
            count(*) filter (where category = 'personal')  as personal_notifications
        from notifications
        where user_id = $1 and read_status = 'unread'
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("notification_counts_for_user query failed")?;

    let mut counts = NotificationCounts {
        system_notifications: row.try_get("system_notifications")?,
        personal_notifications: row.try_get("personal_notifications")?,
        general_notices: active_notice_count(pool, user_id).await?,
        announcements: None,
    };

    // Announcements is treated as best-effort (§4.6): a failure here must
    // not fail the whole snapshot, it just omits the field.
    match announcement_count(pool, user_id).await {
        Ok(n) => counts.announcements = Some(n),
        Err(e) => tracing::warn!(user_id, error = %e, "announcement count failed, omitting from snapshot"),
    }

    Ok(counts)
}

/// Broadcast notices currently active and not yet dismissed by this user
/// (§3.1 `general_notices` — these aren't user-scoped rows, only the
/// dismissal join is).
async fn active_notice_count(pool: &PgPool, user_id: &str) -> Result<i64> {
    let row = sqlx::query(
        r#"
        select count(*) as n
        from notices notc
        where notc.active
          and not exists (
              select 1 from notice_dismissals d
              where d.notice_id = notc.id and d.user_id = $1
          )
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("active_notice_count query failed")?;
    row.try_get("n").context("active_notice_count missing n")
}

async fn announcement_count(pool: &PgPool, user_id: &str) -> Result<i64> {
    let row = sqlx::query(
        "select count(*) as n from notifications where user_id = $1 and read_status = 'unread' and category = 'announcement'",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("announcement_count query failed")?;
    row.try_get("n").context("announcement_count missing n")
}

/// Total unread count across all categories for a single user, used to
/// stamp the `count` field on an outbound `notification` frame (§6). Falls
/// back from the read pool to the write pool once, same as
/// [`notification_counts_for_user`] (§7).
pub async fn total_unread_count(pools: &PgPools, user_id: &str) -> Result<i64> {
    match total_unread_query(&pools.read, user_id).await {
        Ok(n) => Ok(n),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "read pool failed for unread count, retrying on write pool");
            total_unread_query(&pools.write, user_id).await
        }
    }
}

async fn total_unread_query(pool: &PgPool, user_id: &str) -> Result<i64> {
    let row = sqlx::query(
        "select count(*) as n from notifications where user_id = $1 and read_status = 'unread'",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("total_unread_count query failed")?;
    row.try_get("n").context("total_unread_count missing n")
}

/// Mark a notification read, stamping `read_at` (§3.1, §6 write contract).
///
/// Scoped to `user_id` so a connection can only mark its own rows read —
/// `false` means either the row doesn't belong to this user or was already
/// read, and the caller can't distinguish the two from this return value
/// alone (§3.1 deliberately doesn't separate them: both are a no-op).
pub async fn mark_notification_read(pool: &PgPool, user_id: &str, notification_id: i64) -> Result<bool> {
    let result = sqlx::query(
        "update notifications set read_status = 'read', read_at = now() \
         where id = $1 and user_id = $2 and read_status = 'unread'",
    )
    .bind(notification_id)
    .bind(user_id)
    .execute(pool)
    .await
    .context("mark_notification_read failed")?;
    Ok(result.rows_affected() > 0)
}
