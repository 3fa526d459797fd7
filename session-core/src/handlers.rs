use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::input_router::InputEvent;
use crate::pool::SessionPool;
use crate::session::Viewport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state handed to every control-plane and signaling handler. The
/// input channel is the single entry point into the Input Router (C9):
/// `PeerTransport` sends parsed events here as they arrive on a peer's data
/// channel, and the dispatcher task spawned in `main.rs` drains it.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<SessionPool>,
    pub config: Arc<Config>,
    pub input_tx: mpsc::UnboundedSender<(String, String, InputEvent)>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub viewport: Viewport,
    pub websocket_url: String,
}

/// `POST /api/session/create` (spec.md §6).
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> AppResult<Json<CreateSessionResponse>> {
    let handle = state
        .pool
        .create(body.session_id, body.width, body.height)
        .await?;
    Ok(Json(CreateSessionResponse {
        success: true,
        session_id: handle.id().to_string(),
        viewport: handle.viewport(),
        websocket_url: "/ws/signaling".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoadSessionRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct LoadSessionResponse {
    pub success: bool,
    pub url: String,
}

/// Validates the scheme is `http`/`https`, prepending `https://` when the
/// caller omitted one entirely (spec.md §4.10).
fn normalize_load_url(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::Invalid("url must not be empty".into()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(trimmed.to_string());
    }
    if let Some((scheme, _)) = trimmed.split_once("://") {
        return Err(AppError::Invalid(format!("unsupported url scheme {scheme}")));
    }
    Ok(format!("https://{trimmed}"))
}

/// `POST /api/session/{id}/load` (spec.md §6). A navigation that merely hit
/// its deadline is still `success: true` — only a transport-level failure to
/// start navigation is a hard error (spec.md §7 propagation policy).
pub async fn load_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<LoadSessionRequest>,
) -> AppResult<Json<LoadSessionResponse>> {
    let handle = state
        .pool
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(session_id.clone()))?;
    let url = normalize_load_url(&body.url)?;
    let deadline = Duration::from_secs(state.config.navigation_deadline_seconds);
    handle.navigate(url.clone(), deadline).await?;
    Ok(Json(LoadSessionResponse { success: true, url }))
}

/// `DELETE /api/session/{id}` (spec.md §6).
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    state.pool.close(&session_id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub success: bool,
    pub sessions: SessionsBody,
}

#[derive(Debug, Serialize)]
pub struct SessionsBody {
    pub active: usize,
    pub max: usize,
    pub sessions: Vec<String>,
}

/// `GET /api/sessions` (spec.md §6).
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        success: true,
        sessions: SessionsBody {
            active: state.pool.active_count(),
            max: state.pool.max_sessions(),
            sessions: state.pool.list(),
        },
    })
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub session_id: String,
    pub viewport: Viewport,
    pub current_url: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub frames_captured: u64,
    pub frames_skipped: u64,
}

/// `GET /api/session/{id}` — single-session introspection, the counterpart
/// to the snapshot surface in spec.md §6's sessions table (SPEC_FULL.md §3
/// supplement: `created_at`/`current_url` are plain metadata here).
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionResponse>> {
    let handle = state
        .pool
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(session_id.clone()))?;
    let (frames_captured, frames_skipped) = handle.frame_counters();
    Ok(Json(SessionResponse {
        success: true,
        session_id: handle.id().to_string(),
        viewport: handle.viewport(),
        current_url: handle.current_url(),
        created_at: handle.created_at(),
        frames_captured,
        frames_skipped,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: i64,
}

/// `GET /health` (spec.md §6).
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: VERSION,
        timestamp: Utc::now().timestamp(),
    })
}

/// `GET /api/info` (spec.md §6, shape pinned by SPEC_FULL.md §6).
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "version": VERSION,
        "video": {
            "codec": "H264",
            "width": config.video_width,
            "height": config.video_height,
            "framerate": config.framerate,
            "max_framerate": config.max_framerate,
            "min_bitrate": config.min_bitrate,
            "default_bitrate": config.default_bitrate,
            "max_bitrate": config.max_bitrate,
        },
        "audio": {
            "enabled": config.audio_enabled,
            "sample_rate": config.audio_sample_rate,
            "channels": config.audio_channels,
            "frame_duration_ms": 20,
        },
        "browser": {
            "max_sessions": state.pool.max_sessions(),
            "active_sessions": state.pool.active_count(),
        },
    }))
}

/// `GET /metrics` — Prometheus exposition (SPEC_FULL.md A4/§4.10).
pub async fn metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn load_url_prepends_https_when_scheme_missing() {
        assert_eq!(normalize_load_url("example.com").unwrap(), "https://example.com");
    }

    #[test_timeout::timeout]
    fn load_url_keeps_explicit_http_scheme() {
        assert_eq!(normalize_load_url("http://example.com").unwrap(), "http://example.com");
    }

    #[test_timeout::timeout]
    fn load_url_rejects_other_schemes() {
        assert!(normalize_load_url("ftp://example.com").is_err());
    }

    #[test_timeout::timeout]
    fn load_url_rejects_empty_input() {
        assert!(normalize_load_url("   ").is_err());
    }
}
