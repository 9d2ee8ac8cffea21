//! Socket frame envelopes (§4.2, §6).
//!
//! Client→server frames carry an `action` tag; server→client frames carry a
//! `type` tag. The two enums are kept separate rather than folded into one
//! tagged union because the action vocabulary and the push vocabulary don't
//! overlap — a client never receives an `action` frame back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame sent by the client over an established WebSocket (§4.2 action table).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
    GetNotifications,
    SendNotification {
        #[serde(rename = "userId")]
        user_id: String,
        event: String,
        message: String,
    },
    MarkRead {
        #[serde(rename = "notificationId")]
        notification_id: i64,
    },
}

/// Frame pushed by the server (§4.2, §4.6, §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame sent on successful admission (§4.6, §6).
    Connection {
        status: &'static str,
        message: &'static str,
        connection_id: i64,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    NotificationCount(crate::NotificationCounts),
    /// `count` is the user's total unread count at the moment of delivery,
    /// not persisted on `NotificationRecord` itself — it's computed fresh
    /// per push so a client never has to reconcile it against a stale
    /// snapshot (§6).
    Notification {
        event: String,
        message: String,
        count: i64,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_frame_matches_wire_contract() {
        let frame = ServerFrame::Connection {
            status: "connected",
            message: "WebSocket connection established",
            connection_id: 42,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "connection");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["connection_id"], 42);
    }

    #[test]
    fn notification_frame_carries_count_and_no_user_id() {
        let frame = ServerFrame::Notification {
            event: "notification".to_string(),
            message: "hello".to_string(),
            count: 3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["count"], 3);
        assert!(json.get("user_id").is_none());
    }

    #[test]
    fn pong_frame_carries_timestamp() {
        let frame = ServerFrame::Pong { timestamp: Utc::now() };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json.get("timestamp").is_some());
    }
}
