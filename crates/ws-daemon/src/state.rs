//! Shared runtime state for ws-daemon.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself
//! beyond the connection table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use tokio::sync::{mpsc, RwLock};
use ws_db::PgPools;
use ws_registry::RegistryClient;
use ws_schemas::{ServerFrame, ServerId};

/// Idle timeout before a connection is reaped with close code 4001 (§4.2, §4.5).
pub const HEARTBEAT_IDLE_TIME: Duration = Duration::from_secs(180);

/// A background job accepted by Feeder C (§4.4 Task dispatch).
#[derive(Debug, Clone)]
pub enum TaskJob {
    SendNotification {
        user_id: String,
        event: String,
        message: String,
    },
    MarkNotificationRead {
        user_id: String,
        notification_id: i64,
    },
    /// Runs Feeder B's claim-and-deliver body on demand, outside its own
    /// 15s/leader-lock cadence (§4.4 Task dispatch).
    ProcessPendingDbNotifications,
    /// Drains `Q(U)` for each listed user and re-attempts delivery; an
    /// empty list means every user in `ws:active_users` (§4.4 Task
    /// dispatch, SPEC_FULL §4.1.1).
    ProcessQueuedNotifications { user_ids: Vec<String> },
}

/// One locally-live socket, as tracked by the worker that accepted it.
///
/// `last_activity_millis` is an atomic epoch-millis timestamp rather than a
/// per-connection timer task: the idle check is driven by the owning
/// session task's own `tokio::time::sleep`, touched here so any other part
/// of the process (the heartbeat reaper) can observe liveness without
/// locking (§3 "Heartbeat state").
pub struct ConnectionEntry {
    pub user_id: String,
    pub tx: mpsc::UnboundedSender<SessionMessage>,
    pub last_activity_millis: AtomicI64,
}

/// Message delivered into a session's outbound channel: either a frame to
/// push, or an instruction to close. A single channel carries both so the
/// session's send loop handles every outbound event in FIFO order (§5
/// "per-connection FIFO for outbound frames").
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Frame(ServerFrame),
    Close { code: u16, reason: &'static str },
}

/// In-process table of locally-live connections, keyed by handle `H`.
///
/// Exclusively owned by the worker process that accepted each socket (§3
/// "Ownership") — never shared across server processes.
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<HashMap<i64, Arc<ConnectionEntry>>>,
}

impl ConnectionTable {
    pub async fn insert(&self, handle: i64, entry: Arc<ConnectionEntry>) {
        self.inner.write().await.insert(handle, entry);
    }

    pub async fn remove(&self, handle: i64) -> Option<Arc<ConnectionEntry>> {
        self.inner.write().await.remove(&handle)
    }

    pub async fn get(&self, handle: i64) -> Option<Arc<ConnectionEntry>> {
        self.inner.read().await.get(&handle).cloned()
    }

    /// Push a frame to a local handle. Returns `false` if the handle is
    /// unknown or its channel is closed (the receiving session task has
    /// already exited) — the caller treats this as "no longer live" (§4.3
    /// step 3).
    pub async fn push(&self, handle: i64, frame: ServerFrame) -> bool {
        match self.get(handle).await {
            Some(entry) => entry.tx.send(SessionMessage::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Tell a locally-live connection's session task to close with the
    /// given application close code (used for supersession, §4.2's 4003).
    pub async fn force_close(&self, handle: i64, code: u16, reason: &'static str) {
        if let Some(entry) = self.get(handle).await {
            let _ = entry.tx.send(SessionMessage::Close { code, reason });
        }
    }

    pub async fn touch(&self, handle: i64) {
        if let Some(entry) = self.get(handle).await {
            entry
                .last_activity_millis
                .store(now_millis(), Ordering::Relaxed);
        }
    }

    /// Snapshot of `(handle, millis since last activity)` for every locally
    /// live connection, used by the heartbeat reaper's defense-in-depth
    /// sweep (§4.5).
    pub async fn idle_snapshot(&self) -> Vec<(i64, i64)> {
        let now = now_millis();
        self.inner
            .read()
            .await
            .iter()
            .map(|(handle, entry)| (*handle, now - entry.last_activity_millis.load(Ordering::Relaxed)))
            .collect()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cloneable (Arc) handle shared across all Axum handlers and background
/// feeders.
#[derive(Clone)]
pub struct AppState {
    pub server_id: ServerId,
    pub registry: RegistryClient,
    pub pools: PgPools,
    pub connections: Arc<ConnectionTable>,
    pub task_queue: mpsc::UnboundedSender<TaskJob>,
    /// Dedicated (non-pooled) Redis client for Feeder A's pub/sub
    /// subscription — a subscribed connection can't serve ordinary
    /// commands, so it can't come from `registry`'s connection pool.
    pub broker_client: redis::Client,
}

impl AppState {
    pub fn new(
        server_id: ServerId,
        registry: RegistryClient,
        pools: PgPools,
        task_queue: mpsc::UnboundedSender<TaskJob>,
        broker_client: redis::Client,
    ) -> Self {
        Self {
            server_id,
            registry,
            pools,
            connections: Arc::new(ConnectionTable::default()),
            task_queue,
            broker_client,
        }
    }

    /// Allocate the next connection handle `H`, unique across every server
    /// process (SPEC_FULL §4.1.1).
    pub async fn allocate_handle(&self) -> Result<i64> {
        self.registry.next_handle().await
    }
}
