pub mod adaptive;
pub mod audio_source;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame_source;
pub mod handlers;
pub mod input_router;
pub mod pool;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod websocket;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::handlers::AppState;
use crate::input_router::{drop_over_limit, InputEvent, RateLimiterRegistry};
use crate::pool::SessionPool;

/// Assembles the full HTTP surface: control plane (C10), signaling endpoint
/// (C7), and the `/metrics` observability route (SPEC_FULL.md A4). Split out
/// of `main` so integration tests can drive it directly with
/// `tower::ServiceExt::oneshot` instead of a real listener.
pub fn build_router(state: AppState, prometheus_handle: PrometheusHandle) -> Router {
    let cors = build_cors_layer(&state.config);

    let control_plane = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/info", get(handlers::info))
        .route("/api/session/create", axum::routing::post(handlers::create_session))
        .route("/api/session/:id/load", axum::routing::post(handlers::load_session))
        .route(
            "/api/session/:id",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route("/api/sessions", get(handlers::list_sessions))
        .with_state(state.clone());

    let signaling_routes = Router::new()
        .route("/ws/signaling", get(websocket::signaling_handler))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics))
        .with_state(prometheus_handle);

    Router::new()
        .merge(control_plane)
        .merge(signaling_routes)
        .merge(metrics_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<axum::http::HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() {
        warn!("no valid CORS origins configured, falling back to permissive CORS");
        return CorsLayer::new().allow_origin(Any);
    }
    CorsLayer::new().allow_origin(origins)
}

/// Drains the shared input channel that every `PeerTransport`'s data channel
/// feeds (spec.md §4.9). Runs one burst limiter per peer and dispatches
/// validated events into the bound Session's command queue; a session that
/// has since closed or gone missing just drops the event.
pub fn spawn_input_dispatcher(
    pool: Arc<SessionPool>,
    config: Arc<Config>,
    mut input_rx: mpsc::UnboundedReceiver<(String, String, InputEvent)>,
) {
    tokio::spawn(async move {
        let limiters = RateLimiterRegistry::new();
        while let Some((session_id, peer_id, event)) = input_rx.recv().await {
            let limiter = limiters.get_or_create(&peer_id, config.input_events_per_second);
            if !drop_over_limit(&peer_id, &limiter) {
                continue;
            }
            let Some(session) = pool.get(&session_id) else {
                continue;
            };
            if let Err(err) = input_router::dispatch(&session, event, None).await {
                warn!(session = %session_id, peer = %peer_id, %err, "input dispatch failed");
            }
        }
    });
}
