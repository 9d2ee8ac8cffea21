//! ws-daemon entry point.
//!
//! This file is intentionally thin: it resolves configuration, builds the
//! shared state, wires middleware, spawns the Pump feeders, and starts the
//! server. All route handlers and component logic live in the library
//! crate modules.

use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use ws_daemon::{heartbeat, pump, routes, state::AppState};
use ws_schemas::ServerId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience only; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = ws_config::AppConfig::resolve_from_env().context("failed to resolve configuration")?;

    let redis_cfg = deadpool_redis::Config::from_url(cfg.registry.url());
    let registry_pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("failed to build Registry connection pool")?;
    let broker_client =
        redis::Client::open(cfg.registry.url()).context("failed to build broker pub/sub client")?;
    let registry = ws_registry::RegistryClient::new(registry_pool);

    let pools = ws_db::PgPools::connect(&cfg.db).await?;
    pools.migrate().await?;

    let server_id = ServerId::new(
        hostname_or_default(),
        cfg.daemon
            .bind_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(9502),
    );

    let (task_tx, task_rx) = mpsc::unbounded_channel();
    let state = Arc::new(AppState::new(server_id, registry, pools, task_tx, broker_client));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    pump::spawn_all(state.clone(), task_rx, shutdown_rx);
    heartbeat::spawn(state.clone());

    let app = routes::build_router(state.clone())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST]),
        );

    let addr: std::net::SocketAddr = cfg
        .daemon
        .bind_addr
        .parse()
        .with_context(|| format!("invalid WS_ADDR '{}'", cfg.daemon.bind_addr))?;

    if cfg.daemon.tls_material_readable() {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cfg.daemon.tls_cert_path.as_ref().unwrap(),
            cfg.daemon.tls_key_path.as_ref().unwrap(),
        )
        .await
        .context("failed to load TLS cert/key")?;
        let handle = axum_server::Handle::new();
        tokio::spawn(shutdown_on_signal(shutdown_tx, Some(handle.clone())));
        info!("ws-daemon listening on wss://{addr}");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server crashed")?;
    } else {
        if cfg.daemon.tls_cert_path.is_some() || cfg.daemon.tls_key_path.is_some() {
            warn!("WS_TLS_CERT/WS_TLS_KEY set but unreadable, falling back to plaintext");
        }
        info!("ws-daemon listening on ws://{addr}");
        axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
            .with_graceful_shutdown(shutdown_on_signal(shutdown_tx, None))
            .await
            .context("server crashed")?;
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Waits for SIGINT/SIGTERM, then (SPEC_FULL §5.1) tells Feeder B to
/// release its leader lock immediately and, for the TLS listener, tells
/// axum-server to stop accepting new connections while letting in-flight
/// ones finish. Existing WebSocket sockets are not forcibly closed — per
/// §5.1 clients observe the TCP close on process exit and are expected to
/// reconnect.
async fn shutdown_on_signal(shutdown_tx: tokio::sync::watch::Sender<bool>, tls_handle: Option<axum_server::Handle>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = tls_handle {
        handle.graceful_shutdown(None);
    }
}
