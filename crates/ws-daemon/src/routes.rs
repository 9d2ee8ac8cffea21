//! Axum router for ws-daemon.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! (CORS, tracing) after this call so the in-process scenario tests in
//! `tests/` can exercise the bare router.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;
use crate::ws::websocket_handler;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/healthz", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
}

async fn health(State(_st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: "ws-daemon",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}
