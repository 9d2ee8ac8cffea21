//! In-process router scenario tests, driven via `tower::ServiceExt::oneshot`
//! (no bound TCP socket) following the daemon's own scenario-test
//! convention.
//!
//! These tests exercise real Registry and Postgres connections, so they
//! require `DATABASE_URL` and `REDIS_HOST`/`REDIS_PORT` to point at live
//! instances — the same convention the persistence layer's own test
//! tooling expects.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;

use ws_daemon::{routes, state::AppState};
use ws_schemas::ServerId;

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

async fn call(router: axum::Router, req: Request<Body>) -> (StatusCode, Bytes) {
    let response = router.oneshot(req).await.expect("router call failed");
    let status = response.status();
    let body = response.into_body().collect().await.expect("failed to read body").to_bytes();
    (status, body)
}

fn parse_json(bytes: &Bytes) -> serde_json::Value {
    serde_json::from_slice(bytes).expect("response body was not valid JSON")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let state = test_app_state().await;
    let router = routes::build_router(state);

    let (status, body) = call(
        router,
        Request::builder().uri("/healthz").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(&body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "ws-daemon");
}
