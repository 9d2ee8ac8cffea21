//! Feeder A — broker subscriber (§4.4).
//!
//! Long-lived pub/sub subscription on `ws:notification_queue:`. Pub/sub
//! connections are dedicated, not pooled (a subscribed connection can't
//! serve ordinary commands), so this talks to Redis directly via
//! `redis::Client` rather than through the `deadpool_redis` pool used
//! everywhere else in the core.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{error, warn};

use ws_schemas::{keys, NotificationRecord};

use crate::dispatcher;
use crate::state::AppState;

#[derive(Deserialize)]
struct BrokerMessage {
    #[serde(rename = "userId")]
    user_id: String,
    message: String,
}

pub fn spawn(app: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            match subscribe_loop(&app).await {
                Ok(()) => warn!("broker subscription ended without error, resubscribing"),
                Err(e) => error!(error = %e, "broker subscription failed, resubscribing in 5s"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

async fn subscribe_loop(app: &Arc<AppState>) -> anyhow::Result<()> {
    let client = app.broker_client.clone();
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(keys::broker_channel()).await?;
    let mut stream = pubsub.on_message();

    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "broker message had non-string payload, skipping");
                continue;
            }
        };
        let parsed: BrokerMessage = match serde_json::from_str(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, payload, "broker message did not decode, skipping");
                continue;
            }
        };
        let record = NotificationRecord {
            user_id: parsed.user_id,
            event: "notification".to_string(),
            message: parsed.message,
            timestamp: chrono::Utc::now(),
            id: None,
        };
        dispatcher::deliver(app, record).await;
    }

    Ok(())
}
