//! Client for the distributed Registry (§4.1).
//!
//! Wraps a pooled Redis-compatible connection and implements the seven
//! Registry operations the rest of the core depends on: `bind`,
//! `lookup_by_user`, `lookup_by_handle`, `unbind`, `unbind_by_handle`,
//! `enqueue_offline`, `drain_offline`, `offline_len` — plus the
//! `ws:active_users` index and the Feeder B leader-election lock that
//! SPEC_FULL adds on top of the distilled spec.
//!
//! Every fallible Redis round-trip goes through [`with_retry`]: up to 3
//! attempts, 200ms linear backoff (§4.1, §7 "Registry fault").

use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_redis::{redis::AsyncCommands, Pool};
use redis::{RedisError, Script};
use tracing::warn;

use ws_schemas::{keys, Binding, NotificationRecord, ServerId};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);
const OFFLINE_QUEUE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// `unbind`'s compare-and-delete, as a single atomic server-side step:
/// `KEYS[1]` = forward key, `KEYS[2]` = inverse key, `KEYS[3]` =
/// `ws:active_users`; `ARGV[1]` = the expected encoded binding, `ARGV[2]` =
/// the user id. Deletes all three only if the forward key still holds
/// `ARGV[1]`; returns `1`/`0`. Built fresh per call — `Script::new` only
/// stores the source and its SHA1, there's no connection I/O in it, so
/// there's nothing worth caching behind a `once_cell`-style static.
const UNBIND_SCRIPT_SRC: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('DEL', KEYS[2])
    redis.call('SREM', KEYS[3], ARGV[2])
    return 1
else
    return 0
end
"#;

/// Client for the distributed Registry, backed by a pooled connection.
#[derive(Clone)]
pub struct RegistryClient {
    pool: Pool,
}

/// Retry a fallible Redis operation up to [`MAX_ATTEMPTS`] times with a flat
/// 200ms backoff between attempts (§4.1 retry policy). The final failure is
/// returned to the caller, wrapped with `op_name` for diagnosis.
async fn with_retry<T, F, Fut>(op_name: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, RedisError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    op = op_name,
                    attempt, error = %e, "registry operation failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("registry op '{op_name}' failed after {MAX_ATTEMPTS} attempts"))
            }
        }
    }
}

impl RegistryClient {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Bind `user_id` to `(server, handle)`, evicting any prior binding for
    /// this user first so R2 ("at most one live (S,H) per user") holds
    /// before the new binding is published (§3 R1/R2).
    pub async fn bind(&self, user_id: &str, server: &ServerId, handle: i64) -> Result<()> {
        if let Some(prev) = self.lookup_by_user(user_id).await? {
            self.evict_inverse(&prev).await?;
        }

        let new_binding = Binding::new(server.clone(), handle);
        let pool = self.pool.clone();
        let user_fd_key = keys::user_fd(user_id);
        let fd_user_key = keys::fd_user_map(handle);
        let encoded = new_binding.encode();
        let user_id = user_id.to_string();

        with_retry("bind", || {
            let pool = pool.clone();
            let user_fd_key = user_fd_key.clone();
            let fd_user_key = fd_user_key.clone();
            let encoded = encoded.clone();
            let user_id = user_id.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                redis::pipe()
                    .atomic()
                    .set(&user_fd_key, &encoded)
                    .set(&fd_user_key, &user_id)
                    .sadd(keys::active_users(), &user_id)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }

    /// Delete only the inverse entry for a binding that is about to be
    /// superseded; the forward key is overwritten by the caller immediately
    /// after, so it's left alone here.
    async fn evict_inverse(&self, binding: &Binding) -> Result<()> {
        let pool = self.pool.clone();
        let fd_user_key = keys::fd_user_map(binding.handle);
        with_retry("evict_inverse", || {
            let pool = pool.clone();
            let fd_user_key = fd_user_key.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                conn.del::<_, ()>(&fd_user_key).await
            }
        })
        .await
    }

    pub async fn lookup_by_user(&self, user_id: &str) -> Result<Option<Binding>> {
        let pool = self.pool.clone();
        let key = keys::user_fd(user_id);
        let raw: Option<String> = with_retry("lookup_by_user", || {
            let pool = pool.clone();
            let key = key.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                conn.get(&key).await
            }
        })
        .await?;
        Ok(raw.and_then(|s| Binding::decode(&s)))
    }

    pub async fn lookup_by_handle(&self, handle: i64) -> Result<Option<String>> {
        let pool = self.pool.clone();
        let key = keys::fd_user_map(handle);
        with_retry("lookup_by_handle", || {
            let pool = pool.clone();
            let key = key.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                conn.get(&key).await
            }
        })
        .await
    }

    /// Compare-and-delete: removes the binding only if it still matches
    /// `expected`, so a socket closing after it has already been superseded
    /// does not clobber the newer binding (§3 R2, close code 4003).
    ///
    /// The check and the delete run as a single Lua script (`EVAL`) rather
    /// than a `GET` followed by an unconditional pipe — a plain
    /// read-then-delete leaves a window between the two round-trips where a
    /// concurrent `bind()` for the same user (a second connection
    /// superseding this one) can install a brand-new forward/inverse pair
    /// that this stale `unbind` would otherwise delete out from under it,
    /// breaking R1/R2. The script makes "still matches `expected`" and "is
    /// deleted" one atomic server-side step, same approach `renew_leader_lock`
    /// below would need a compare-and-expire script to close its own
    /// best-effort window.
    pub async fn unbind(&self, user_id: &str, expected: &Binding) -> Result<bool> {
        let pool = self.pool.clone();
        let user_fd_key = keys::user_fd(user_id);
        let fd_user_key = keys::fd_user_map(expected.handle);
        let active_users_key = keys::active_users().to_string();
        let expected_encoded = expected.encode();
        let user_id_owned = user_id.to_string();
        with_retry("unbind", || {
            let pool = pool.clone();
            let user_fd_key = user_fd_key.clone();
            let fd_user_key = fd_user_key.clone();
            let active_users_key = active_users_key.clone();
            let expected_encoded = expected_encoded.clone();
            let user_id_owned = user_id_owned.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                Script::new(UNBIND_SCRIPT_SRC)
                    .key(user_fd_key)
                    .key(fd_user_key)
                    .key(active_users_key)
                    .arg(expected_encoded)
                    .arg(user_id_owned)
                    .invoke_async::<_, bool>(&mut conn)
                    .await
            }
        })
        .await
    }

    /// Same compare-and-delete as [`Self::unbind`], entered from the
    /// handle side: used by the heartbeat reaper, which only knows the
    /// local `(server, handle)` it is evicting, not the user (§4.5).
    pub async fn unbind_by_handle(&self, server: &ServerId, handle: i64) -> Result<Option<String>> {
        let Some(user_id) = self.lookup_by_handle(handle).await? else {
            return Ok(None);
        };
        let expected = Binding::new(server.clone(), handle);
        if self.unbind(&user_id, &expected).await? {
            Ok(Some(user_id))
        } else {
            Ok(None)
        }
    }

    /// Append a notification to `ws:notification_queue:<U>` with a 7-day TTL
    /// (§3 Q1).
    pub async fn enqueue_offline(&self, user_id: &str, record: &NotificationRecord) -> Result<()> {
        let payload =
            serde_json::to_string(record).context("failed to serialize notification record")?;
        let pool = self.pool.clone();
        let key = keys::notification_queue(user_id);
        with_retry("enqueue_offline", || {
            let pool = pool.clone();
            let key = key.clone();
            let payload = payload.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                redis::pipe()
                    .atomic()
                    .rpush(&key, payload)
                    .expire(&key, OFFLINE_QUEUE_TTL_SECS)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }

    /// Drain the full offline queue for `user_id`, returning records oldest
    /// first. Malformed entries are logged and skipped rather than failing
    /// the whole drain — one corrupt record shouldn't strand the rest.
    pub async fn drain_offline(&self, user_id: &str) -> Result<Vec<NotificationRecord>> {
        let pool = self.pool.clone();
        let key = keys::notification_queue(user_id);
        let raw: Vec<String> = with_retry("drain_offline", || {
            let pool = pool.clone();
            let key = key.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                let (items, _): (Vec<String>, ()) = redis::pipe()
                    .atomic()
                    .lrange(&key, 0, -1)
                    .del(&key)
                    .query_async(&mut conn)
                    .await?;
                Ok(items)
            }
        })
        .await?;

        Ok(raw
            .into_iter()
            .filter_map(|s| match serde_json::from_str(&s) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(user_id, error = %e, "dropping malformed offline notification record");
                    None
                }
            })
            .collect())
    }

    pub async fn offline_len(&self, user_id: &str) -> Result<usize> {
        let pool = self.pool.clone();
        let key = keys::notification_queue(user_id);
        with_retry("offline_len", || {
            let pool = pool.clone();
            let key = key.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                conn.llen(&key).await
            }
        })
        .await
    }

    /// Allocate the next globally-unique connection handle `H` (SPEC_FULL
    /// §4.1.1). Backed by `INCR` on a dedicated sequence key so `H` never
    /// collides across server processes, which matters because
    /// `ws:fd_user_map:<H>` is keyed by `H` alone (§6).
    pub async fn next_handle(&self) -> Result<i64> {
        let pool = self.pool.clone();
        with_retry("next_handle", || {
            let pool = pool.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                conn.incr(keys::handle_sequence(), 1).await
            }
        })
        .await
    }

    /// All users with a live forward binding on any server process.
    /// Resolves the `getAllUserFds` gap left open in §9 (SPEC_FULL §4.1.1).
    pub async fn list_active_users(&self) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        with_retry("list_active_users", || {
            let pool = pool.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                conn.smembers(keys::active_users()).await
            }
        })
        .await
    }

    /// Attempt to acquire the Feeder B leader lock (SPEC_FULL §4.4.1).
    /// Returns `true` if this call took the lock.
    pub async fn try_acquire_leader_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let pool = self.pool.clone();
        let owner = owner.to_string();
        let ttl_ms = ttl.as_millis() as usize;
        with_retry("try_acquire_leader_lock", || {
            let pool = pool.clone();
            let owner = owner.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                redis::cmd("SET")
                    .arg(keys::db_poller_lock())
                    .arg(&owner)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
                    .map(|v| v.is_some())
            }
        })
        .await
    }

    /// Renew the leader lock if still held by `owner`. Best-effort: does not
    /// use an atomic compare-and-expire script, so a lock that expired and
    /// was re-acquired by a peer in the window between the check and this
    /// call will be overwritten. The window is bounded by the lock TTL and
    /// acceptable here because losing leadership briefly only delays one
    /// poll tick (§4.4.1), never causes double delivery.
    pub async fn renew_leader_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let pool = self.pool.clone();
        let owner = owner.to_string();
        let ttl_ms = ttl.as_millis() as usize;
        with_retry("renew_leader_lock", || {
            let pool = pool.clone();
            let owner = owner.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                let current: Option<String> = conn.get(keys::db_poller_lock()).await?;
                if current.as_deref() != Some(owner.as_str()) {
                    return Ok(false);
                }
                redis::cmd("SET")
                    .arg(keys::db_poller_lock())
                    .arg(&owner)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Ok(true)
            }
        })
        .await
    }

    pub async fn release_leader_lock(&self, owner: &str) -> Result<()> {
        let pool = self.pool.clone();
        let owner = owner.to_string();
        with_retry("release_leader_lock", || {
            let pool = pool.clone();
            let owner = owner.clone();
            async move {
                let mut conn = pool.get().await.map_err(to_redis_error)?;
                let current: Option<String> = conn.get(keys::db_poller_lock()).await?;
                if current.as_deref() == Some(owner.as_str()) {
                    conn.del::<_, ()>(keys::db_poller_lock()).await?;
                }
                Ok(())
            }
        })
        .await
    }
}

fn to_redis_error(e: deadpool_redis::PoolError) -> RedisError {
    RedisError::from(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_roundtrips_through_encode_decode() {
        let b = Binding::new(ServerId::new("host-a", 9502), 17);
        let decoded = Binding::decode(&b.encode()).unwrap();
        assert_eq!(b, decoded);
    }

    #[test]
    fn binding_decode_rejects_missing_handle() {
        assert!(Binding::decode("host-a:9502").is_none());
    }
}
