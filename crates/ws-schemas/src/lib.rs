//! Wire types for the real-time delivery core.
//!
//! This crate owns everything that crosses a process boundary: the JSON frame
//! envelopes spoken over the WebSocket (§6), the Registry key-encoding
//! contract (§4.1, §6), and the small set of outcome/identity types shared
//! between the Dispatcher, Session Manager, and Pump.

pub mod frames;
pub mod keys;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A notification record as it crosses the delivery core: produced by a
/// Pump feeder, consumed by the Dispatcher, and — when the user is not
/// locally live — serialized into the offline queue (§3, §4.3).
///
/// Values are opaque to the core beyond what's needed to route and render
/// them; the core does not interpret `event` or `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub user_id: String,
    pub event: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Present when the record originated from a persisted `notifications`
    /// row; absent for notifications synthesized purely in-memory (e.g. a
    /// `send_notification` task with no DB row yet).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// Outcome of `Dispatcher::deliver` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// Pushed directly onto a live local socket.
    Delivered,
    /// No live binding was found (or the local push failed); the record was
    /// appended to the user's offline queue.
    Queued,
    /// The message body was empty, or the Registry itself could not be
    /// reached to enqueue — nothing was delivered and nothing was queued
    /// (§4.3, §7 "Registry fault").
    Dropped,
}

/// `hostname:port` identifying one server process.
///
/// A connection handle `H` is only meaningful paired with the `ServerId` of
/// the process that accepted it (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self(format!("{}:{}", host.as_ref(), port))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Registry binding: the `(S, H)` pair bound to some user (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub server: ServerId,
    pub handle: i64,
}

impl Binding {
    pub fn new(server: ServerId, handle: i64) -> Self {
        Self { server, handle }
    }

    /// Encode as the flat string stored behind `ws:user_fd:<U>` (§6).
    ///
    /// The wire contract only requires the handle to round-trip (downstream
    /// consumers read `ws:user_fd:<U>` as "a string integer"); the server
    /// identity travels alongside it, `<server>|<handle>`, so a remote
    /// reader of the forward key can tell local bindings apart from ones
    /// owned by a peer process without a second round-trip.
    pub fn encode(&self) -> String {
        format!("{}|{}", self.server.0, self.handle)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (server, handle) = s.rsplit_once('|')?;
        Some(Self {
            server: ServerId(server.to_string()),
            handle: handle.parse().ok()?,
        })
    }
}

/// Per-user notification-count snapshot (§3.1, §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationCounts {
    pub system_notifications: i64,
    pub general_notices: i64,
    pub personal_notifications: i64,
    /// Omitted from the wire payload (not merely `null`) when the
    /// announcements query fails — §4.6 treats that failure as non-fatal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announcements: Option<i64>,
}
