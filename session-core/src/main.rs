use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;
use tracing::info;

use session_core::config::Config;
use session_core::handlers::AppState;
use session_core::input_router::InputEvent;
use session_core::pool::SessionPool;
use session_core::{build_router, spawn_input_dispatcher};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env());
    info!(port = config.port, max_sessions = config.max_sessions, "starting session-core");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    let pool = SessionPool::new(config.clone());
    let (input_tx, input_rx) = mpsc::unbounded_channel::<(String, String, InputEvent)>();
    spawn_input_dispatcher(pool.clone(), config.clone(), input_rx);

    let state = AppState { pool, config: config.clone(), input_tx };
    let app = build_router(state, prometheus_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind control-plane listener");
    info!(%addr, "session-core listening");

    axum::serve(listener, app.into_make_service())
        .await
        .expect("server exited unexpectedly");
}
