//! Session Manager (§4.2): owns an accepted socket from admission through
//! teardown — the state machine, the ping/pong idle timer, inbound-frame
//! dispatch, and supersession.
//!
//! Structurally this follows the accept-then-split-then-two-tasks pattern
//! used throughout the corpus for WebSocket gateways: build the initial
//! payload, register the connection, spawn a send task and a recv task, and
//! race them with `tokio::select!` so either side finishing tears the whole
//! connection down.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use ws_schemas::frames::ClientFrame;
use ws_schemas::{NotificationRecord, ServerFrame};

use crate::state::{AppState, ConnectionEntry, SessionMessage, HEARTBEAT_IDLE_TIME};
use crate::{dispatcher, initial_state};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// `GET /` — upgrade to a WebSocket connection (§6).
///
/// The upgrade itself always succeeds; admission validation (missing or
/// non-numeric `userId`) happens after the upgrade completes, because close
/// codes are a WebSocket-level concept (§4.2 admission step 1).
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(app): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.user_id, app))
}

fn is_valid_user_id(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit())
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(mut socket: WebSocket, user_id_raw: Option<String>, app: Arc<AppState>) {
    let Some(user_id) = user_id_raw.filter(|s| is_valid_user_id(s)) else {
        close_with(&mut socket, 4000, "missing or invalid userId").await;
        return;
    };

    let handle = match app.allocate_handle().await {
        Ok(h) => h,
        Err(e) => {
            warn!(user_id, error = %e, "failed to allocate connection handle, refusing admission");
            close_with(&mut socket, 1011, "internal error").await;
            return;
        }
    };

    // Admission step 2: a handle number being reused mid-process only
    // happens if the sequence allocator ever wraps; defensive cleanup per
    // §4.2 step 2.
    if let Ok(Some(stale_user)) = app.registry.lookup_by_handle(handle).await {
        warn!(handle, stale_user, "handle already mapped at admission, clearing stale entry");
        let _ = app.registry.unbind_by_handle(&app.server_id, handle).await;
    }

    // Admission step 3: force-evict a prior local connection for this user
    // before the new binding is published. `bind` (below) performs the
    // Registry-side eviction atomically; if the prior binding was local we
    // also have to tell that live socket to close.
    if let Ok(Some(prior)) = app.registry.lookup_by_user(&user_id).await {
        if prior.server == app.server_id {
            app.connections
                .force_close(prior.handle, 4003, "superseded by new connection")
                .await;
        }
    }

    if let Err(e) = app.registry.bind(&user_id, &app.server_id, handle).await {
        warn!(user_id, handle, error = %e, "registry bind failed, refusing admission");
        close_with(&mut socket, 1011, "internal error").await;
        return;
    }

    // Initial-State Responder (§4.6): built before the connection is
    // registered locally so nothing else can race a push in ahead of it.
    let ack = initial_state::connection_ack(handle);
    let counts = initial_state::notification_count_frame(&app, &user_id).await;

    let (ws_sink, ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<SessionMessage>();

    let entry = Arc::new(ConnectionEntry {
        user_id: user_id.clone(),
        tx: tx.clone(),
        last_activity_millis: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
    });
    app.connections.insert(handle, entry).await;

    let _ = tx.send(SessionMessage::Frame(ack));
    let _ = tx.send(SessionMessage::Frame(counts));

    // Flush anything queued while this user had no live binding (§3 Q1,
    // §8 scenario 2) — in FIFO order, now that the new binding is live so
    // nothing else can re-enqueue ahead of this drain.
    match app.registry.drain_offline(&user_id).await {
        Ok(backlog) if !backlog.is_empty() => {
            info!(user_id, handle, count = backlog.len(), "flushing offline backlog");
            for record in backlog {
                let frame = dispatcher::notification_frame(&app, &record).await;
                let _ = tx.send(SessionMessage::Frame(frame));
            }
        }
        Ok(_) => {}
        Err(e) => warn!(user_id, handle, error = %e, "failed to drain offline backlog on connect"),
    }

    info!(user_id, handle, "connection admitted");

    let send_task = tokio::spawn(send_loop(ws_sink, rx));
    let recv_task = tokio::spawn(recv_loop(
        ws_stream,
        app.clone(),
        user_id.clone(),
        handle,
        tx,
    ));

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    teardown(&app, &user_id, handle).await;
}

/// Forward queued frames/close instructions to the socket, in order, until
/// the channel closes or a close instruction is sent (§5 per-connection FIFO).
async fn send_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            SessionMessage::Frame(frame) => {
                let Ok(json) = serde_json::to_string(&frame) else {
                    warn!("failed to serialize outbound frame");
                    continue;
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            SessionMessage::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Read inbound frames, dispatching each to its action handler, and enforce
/// the 180s idle timeout (§4.2 state machine, §4.5).
async fn recv_loop(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    app: Arc<AppState>,
    user_id: String,
    handle: i64,
    tx: mpsc::UnboundedSender<SessionMessage>,
) {
    loop {
        let deadline = sleep(HEARTBEAT_IDLE_TIME);
        tokio::select! {
            _ = deadline => {
                info!(user_id, handle, "idle timeout, closing");
                let _ = tx.send(SessionMessage::Close { code: 4001, reason: "idle timeout" });
                return;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(Message::Text(text))) => {
                        app.connections.touch(handle).await;
                        if !handle_inbound(&app, &user_id, handle, &text, &tx).await {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        app.connections.touch(handle).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(Message::Binary(_))) => {
                        // Binary frames are not part of the wire contract (§6 "JSON
                        // text frames only") — treat as a protocol violation.
                        let _ = tx.send(SessionMessage::Close { code: 1007, reason: "binary frames unsupported" });
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(user_id, handle, error = %e, "websocket read error");
                        return;
                    }
                }
            }
        }
    }
}

/// Decode and act on one inbound text frame. Returns `false` if the
/// connection should close (malformed frame, or the Registry says this
/// handle no longer belongs to `user_id`).
async fn handle_inbound(
    app: &Arc<AppState>,
    user_id: &str,
    handle: i64,
    text: &str,
    tx: &mpsc::UnboundedSender<SessionMessage>,
) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(user_id, handle, error = %e, "malformed inbound frame");
            let _ = tx.send(SessionMessage::Close { code: 1007, reason: "malformed frame" });
            return false;
        }
    };

    // §4.2.1: a handle whose inverse mapping no longer resolves to this
    // user means the binding was evicted out from under us (superseded
    // remotely, or cleaned up by the heartbeat reaper) without this
    // session's own teardown running — close as "user not found".
    match app.registry.lookup_by_handle(handle).await {
        Ok(Some(ref mapped)) if mapped == user_id => {}
        Ok(_) => {
            let _ = tx.send(SessionMessage::Close { code: 4002, reason: "user not found for active socket" });
            return false;
        }
        Err(e) => {
            warn!(user_id, handle, error = %e, "registry consistency check failed, continuing optimistically");
        }
    }

    match frame {
        ClientFrame::Ping => {
            let _ = tx.send(SessionMessage::Frame(ServerFrame::Pong {
                timestamp: chrono::Utc::now(),
            }));
        }
        ClientFrame::Pong => {
            // No-op; the idle timer was already reset by `touch` above.
        }
        ClientFrame::GetNotifications => {
            let frame = initial_state::notification_count_frame(app, user_id).await;
            let _ = tx.send(SessionMessage::Frame(frame));
        }
        ClientFrame::SendNotification {
            user_id: target,
            event,
            message,
        } => {
            let _ = app.task_queue.send(crate::state::TaskJob::SendNotification {
                user_id: target,
                event,
                message,
            });
        }
        ClientFrame::MarkRead { notification_id } => {
            let _ = app.task_queue.send(crate::state::TaskJob::MarkNotificationRead {
                user_id: user_id.to_string(),
                notification_id,
            });
        }
    }
    true
}

/// Close path (§4.2 `close`): resolve, compare-and-delete, drop local state.
async fn teardown(app: &Arc<AppState>, user_id: &str, handle: i64) {
    app.connections.remove(handle).await;
    if let Err(e) = app.registry.unbind_by_handle(&app.server_id, handle).await {
        warn!(user_id, handle, error = %e, "failed to unbind on teardown");
    }
}

/// Entry point used by Feeder A/B/C to push a notification straight to a
/// live local socket or the offline queue, without going through the
/// WebSocket layer.
pub async fn deliver_notification(app: &AppState, record: NotificationRecord) -> ws_schemas::DeliverOutcome {
    dispatcher::deliver(app, record).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_and_non_numeric_user_ids() {
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("abc"));
        assert!(!is_valid_user_id("12a"));
    }

    #[test]
    fn accepts_numeric_user_ids() {
        assert!(is_valid_user_id("1"));
        assert!(is_valid_user_id("908765"));
    }

    #[test]
    fn client_frame_decodes_each_action() {
        let ping: ClientFrame = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientFrame::Ping));

        let mark_read: ClientFrame =
            serde_json::from_str(r#"{"action":"mark_read","notificationId":42}"#).unwrap();
        assert!(matches!(mark_read, ClientFrame::MarkRead { notification_id: 42 }));

        let send: ClientFrame = serde_json::from_str(
            r#"{"action":"send_notification","userId":"7","event":"e","message":"m"}"#,
        )
        .unwrap();
        match send {
            ClientFrame::SendNotification { user_id, event, message } => {
                assert_eq!(user_id, "7");
                assert_eq!(event, "e");
                assert_eq!(message, "m");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_frame_rejects_unknown_action() {
        let result: Result<ClientFrame, _> = serde_json::from_str(r#"{"action":"frobnicate"}"#);
        assert!(result.is_err());
    }
}
