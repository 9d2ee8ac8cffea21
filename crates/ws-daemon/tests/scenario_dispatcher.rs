//! Dispatcher scenario tests against live Registry/Postgres connections
//! (see `scenario_health.rs` for the environment this expects).

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use ws_daemon::state::{AppState, ConnectionEntry, SessionMessage};
use ws_daemon::dispatcher;
use ws_schemas::{NotificationRecord, ServerId};

async fn test_app_state() -> Arc<AppState> {
    let cfg = ws_config::AppConfig::resolve_from_env().expect("test env must set DATABASE_URL/REDIS_HOST");
    let redis_cfg = deadpool_redis::Config::from_url(cfg.registry.url());
    let pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("failed to build test Registry pool");
    let broker_client = redis::Client::open(cfg.registry.url()).expect("failed to build test broker client");
    let registry = ws_registry::RegistryClient::new(pool);
    let pools = ws_db::PgPools::connect(&cfg.db).await.expect("failed to connect test db pools");
    pools.migrate().await.expect("failed to migrate test db");
    let (task_tx, _task_rx) = tokio::sync::mpsc::unbounded_channel();
    Arc::new(AppState::new(
        ServerId::new("test-host", 9502),
        registry,
        pools,
        task_tx,
        broker_client,
    ))
}

#[tokio::test]
async fn empty_message_for_offline_user_is_dropped() {
    let app = test_app_state().await;
    let user_id = format!("user-empty-msg-{}", uuid::Uuid::new_v4());
    let record = NotificationRecord {
        user_id: user_id.clone(),
        event: "e".to_string(),
        message: String::new(),
        timestamp: chrono::Utc::now(),
        id: None,
    };
    let outcome = dispatcher::deliver(&app, record).await;
    assert_eq!(outcome, ws_schemas::DeliverOutcome::Dropped);
    assert_eq!(app.registry.offline_len(&user_id).await.expect("offline_len failed"), 0);
}

/// §4.3 step 4 scopes "empty message → Dropped" to the enqueue branch only;
/// an online user's live socket still gets pushed to.
#[tokio::test]
async fn empty_message_for_online_user_is_still_delivered() {
    let app = test_app_state().await;
    let user_id = format!("user-online-empty-msg-{}", uuid::Uuid::new_v4());
    let handle = app.allocate_handle().await.expect("handle allocation failed");
    app.registry
        .bind(&user_id, &app.server_id, handle)
        .await
        .expect("bind failed");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let entry = Arc::new(ConnectionEntry {
        user_id: user_id.clone(),
        tx,
        last_activity_millis: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
    });
    app.connections.insert(handle, entry).await;

    let record = NotificationRecord {
        user_id: user_id.clone(),
        event: "e".to_string(),
        message: String::new(),
        timestamp: chrono::Utc::now(),
        id: None,
    };
    let outcome = dispatcher::deliver(&app, record).await;
    assert_eq!(outcome, ws_schemas::DeliverOutcome::Delivered);
    assert!(matches!(rx.recv().await, Some(SessionMessage::Frame(_))));
}

#[tokio::test]
async fn unbound_user_is_queued_into_offline_queue() {
    let app = test_app_state().await;
    let user_id = format!("user-unbound-{}", uuid::Uuid::new_v4());
    let record = NotificationRecord {
        user_id: user_id.clone(),
        event: "e".to_string(),
        message: "hello".to_string(),
        timestamp: chrono::Utc::now(),
        id: None,
    };

    let outcome = dispatcher::deliver(&app, record).await;
    assert_eq!(outcome, ws_schemas::DeliverOutcome::Queued);

    let drained = app.registry.drain_offline(&user_id).await.expect("drain failed");
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].message, "hello");
}

#[tokio::test]
async fn bind_then_unbind_roundtrips_through_registry() {
    let app = test_app_state().await;
    let user_id = format!("user-bind-{}", uuid::Uuid::new_v4());
    let handle = app.allocate_handle().await.expect("handle allocation failed");

    app.registry
        .bind(&user_id, &app.server_id, handle)
        .await
        .expect("bind failed");

    let binding = app
        .registry
        .lookup_by_user(&user_id)
        .await
        .expect("lookup failed")
        .expect("binding missing after bind");
    assert_eq!(binding.handle, handle);
    assert_eq!(binding.server, app.server_id);

    let evicted = app
        .registry
        .unbind(&user_id, &binding)
        .await
        .expect("unbind failed");
    assert!(evicted);
    assert!(app
        .registry
        .lookup_by_user(&user_id)
        .await
        .expect("lookup after unbind failed")
        .is_none());
}

/// §3 R2 / §9: a stale `unbind` carrying a superseded binding must not
/// clobber the newer one a concurrent reconnect already installed — this is
/// the compare-and-delete contract `unbind`'s Lua script enforces
/// atomically rather than via a separate `GET` then `DEL`.
#[tokio::test]
async fn stale_unbind_after_supersession_does_not_clobber_new_binding() {
    let app = test_app_state().await;
    let user_id = format!("user-supersede-{}", uuid::Uuid::new_v4());

    let old_handle = app.allocate_handle().await.expect("handle allocation failed");
    app.registry
        .bind(&user_id, &app.server_id, old_handle)
        .await
        .expect("first bind failed");
    let old_binding = app
        .registry
        .lookup_by_user(&user_id)
        .await
        .expect("lookup failed")
        .expect("binding missing after first bind");

    // A second connection for the same user supersedes the first.
    let new_handle = app.allocate_handle().await.expect("handle allocation failed");
    app.registry
        .bind(&user_id, &app.server_id, new_handle)
        .await
        .expect("second bind failed");

    // The old connection's close path runs late, still holding the old
    // binding. Its compare-and-delete must be a no-op now.
    let evicted = app
        .registry
        .unbind(&user_id, &old_binding)
        .await
        .expect("stale unbind failed");
    assert!(!evicted);

    let current = app
        .registry
        .lookup_by_user(&user_id)
        .await
        .expect("lookup after stale unbind failed")
        .expect("binding should still exist");
    assert_eq!(current.handle, new_handle);
    assert_eq!(
        app.registry
            .lookup_by_handle(new_handle)
            .await
            .expect("lookup_by_handle failed"),
        Some(user_id)
    );
}
