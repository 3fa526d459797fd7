use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::session::{SessionHandle, Viewport};

/// A validated, tagged input event off a peer's data channel. Closed variant
/// set per the "dynamic dispatch on event kind" redesign note in spec.md §9:
/// one exhaustive dispatcher below, no trait-object event handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    Click { x: i32, y: i32 },
    Scroll {
        #[serde(rename = "deltaX", default)]
        delta_x: i32,
        #[serde(rename = "deltaY")]
        delta_y: i32,
    },
    Text { text: String },
    Key { key: String },
}

/// Token bucket limiting a single peer's effective input rate to `K`
/// events/sec (spec.md §4.9). Unlike a fixed per-second counter reset, a
/// token bucket can't be doubled by bursting across a window boundary
/// (SPEC_FULL.md §4.9 supplement).
pub struct RateLimiter {
    capacity: f64,
    tokens: Mutex<(f64, Instant)>,
    refill_per_second: f64,
}

impl RateLimiter {
    pub fn new(events_per_second: u32) -> Self {
        let capacity = events_per_second as f64;
        Self {
            capacity,
            tokens: Mutex::new((capacity, Instant::now())),
            refill_per_second: capacity,
        }
    }

    /// Returns `true` if an event may proceed, consuming one token.
    pub fn try_acquire(&self) -> bool {
        let mut guard = self.tokens.lock().unwrap();
        let (tokens, last) = *guard;
        let elapsed = last.elapsed().as_secs_f64();
        let refilled = (tokens + elapsed * self.refill_per_second).min(self.capacity);
        if refilled >= 1.0 {
            *guard = (refilled - 1.0, Instant::now());
            true
        } else {
            *guard = (refilled, Instant::now());
            false
        }
    }
}

/// Maps a coordinate from the client's reported viewport into the session's
/// current viewport with a linear rescale, or the identity map when the two
/// agree (spec.md §4.9, §8 "viewport round-trip" property).
pub fn rescale_coordinate(x: i32, y: i32, client: Viewport, session: Viewport) -> (i32, i32) {
    if client.width == session.width && client.height == session.height {
        return (x, y);
    }
    let scaled_x = (x as f64 * session.width as f64 / client.width.max(1) as f64).round() as i32;
    let scaled_y = (y as f64 * session.height as f64 / client.height.max(1) as f64).round() as i32;
    (scaled_x, scaled_y)
}

/// Validates, rescales, and dispatches one input event into the bound
/// Session's command queue. Coordinates are assumed already expressed in
/// the session's current viewport unless `client_viewport` says otherwise;
/// see `rescale_coordinate`.
pub async fn dispatch(
    session: &SessionHandle,
    event: InputEvent,
    client_viewport: Option<Viewport>,
) -> AppResult<()> {
    let session_viewport = session.viewport();
    match event {
        InputEvent::Click { x, y } => {
            let (x, y) = match client_viewport {
                Some(client) => rescale_coordinate(x, y, client, session_viewport),
                None => (x, y),
            };
            if x < 0 || y < 0 {
                return Err(AppError::Invalid("click coordinates must be non-negative".into()));
            }
            session.click(x, y).await
        }
        InputEvent::Scroll { delta_x, delta_y } => {
            session.scroll(0, 0, delta_x, delta_y).await
        }
        InputEvent::Text { text } => session.type_text(text).await,
        InputEvent::Key { key } => session.press_key(key).await,
    }
}

/// Per-peer rate limiters, keyed by peer id. Owned by the websocket/input
/// plumbing layer, not the Session (a peer's burst budget is a transport
/// concern, not session state).
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, std::sync::Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, peer_id: &str, events_per_second: u32) -> std::sync::Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap();
        limiters
            .entry(peer_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(RateLimiter::new(events_per_second)))
            .clone()
    }

    pub fn remove(&self, peer_id: &str) {
        self.limiters.lock().unwrap().remove(peer_id);
    }
}

pub fn drop_over_limit(peer_id: &str, limiter: &RateLimiter) -> bool {
    if limiter.try_acquire() {
        true
    } else {
        warn!(peer = peer_id, "input event dropped: burst limit exceeded");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn identity_map_when_viewports_agree() {
        let v = Viewport { width: 720, height: 1280 };
        assert_eq!(rescale_coordinate(100, 200, v, v), (100, 200));
    }

    #[test_timeout::timeout]
    fn rescales_linearly_when_viewports_differ() {
        let client = Viewport { width: 360, height: 640 };
        let session = Viewport { width: 720, height: 1280 };
        assert_eq!(rescale_coordinate(100, 200, client, session), (200, 400));
    }

    #[test_timeout::timeout]
    fn rate_limiter_drops_excess_bursts() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test_timeout::timeout]
    fn click_input_event_round_trips_json() {
        let event: InputEvent = serde_json::from_str(r#"{"type":"click","x":10,"y":20}"#).unwrap();
        matches!(event, InputEvent::Click { x: 10, y: 20 });
    }
}
