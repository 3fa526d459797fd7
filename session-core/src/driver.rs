use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::AppError;

const CAPTURE_QUALITY: u8 = 85;

const MOBILE_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 10) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// The canonical named-key set the input router may dispatch through
/// `press_key`. Anything outside this set is rejected with `UnknownKey`.
pub const NAMED_KEYS: &[&str] = &[
    "Enter",
    "Backspace",
    "Tab",
    "Escape",
    "Delete",
    "ArrowUp",
    "ArrowDown",
    "ArrowLeft",
    "ArrowRight",
    "Home",
    "End",
    "PageUp",
    "PageDown",
    "Space",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigateOutcome {
    Complete,
    /// The navigation deadline elapsed before the round trip completed. The
    /// page is frequently still usable, so callers treat this as success.
    Partial,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver request timed out")]
    Timeout,
    #[error("driver connection closed")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unknown key {0}")]
    UnknownKey(String),
}

impl From<DriverError> for AppError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::UnknownKey(name) => AppError::Invalid(format!("unknown key {name}")),
            DriverError::Timeout => AppError::Driver("driver request timed out".into()),
            DriverError::Disconnected => AppError::Driver("driver disconnected".into()),
            DriverError::Protocol(msg) => AppError::Driver(msg),
        }
    }
}

#[derive(Deserialize)]
struct NewTargetResponse {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// One connection to a single headless-browser tab over its remote-debugging
/// protocol. Every public method is a request/response round trip; the
/// caller is expected to serialize access (the owning Session's command
/// queue does this — see `session.rs`). Unsolicited protocol events are
/// read and discarded by the background reader; the core doesn't currently
/// act on any of them asynchronously.
pub struct BrowserDriver {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<Value, DriverError>>>>,
    next_id: AtomicU64,
    rpc_timeout: Duration,
}

impl BrowserDriver {
    /// Launches a tab against the browser's devtools HTTP endpoint and opens
    /// its per-tab debugger websocket. Returns ready only after the tab has
    /// acknowledged the initial viewport/emulation round trip.
    pub async fn new_session(
        browser_http_base: &str,
        width: u32,
        height: u32,
        rpc_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let create_url = format!("{}/json/new?about:blank", browser_http_base.trim_end_matches('/'));
        let response = reqwest::get(&create_url)
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?
            .json::<NewTargetResponse>()
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;

        let driver = Self::connect(&response.web_socket_debugger_url, rpc_timeout).await?;
        driver.init_session(width, height).await?;
        Ok(driver)
    }

    /// Connects to an already-known tab debugger websocket URL, bypassing
    /// the `/json/new` bootstrap. Used by tests against a fake CDP server.
    pub async fn connect(debugger_ws_url: &str, rpc_timeout: Duration) -> Result<Self, DriverError> {
        let (ws, _) = tokio_tungstenite::connect_async(debugger_ws_url)
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        let (mut write, mut read) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<DashMap<u64, oneshot::Sender<Result<Value, DriverError>>>> =
            Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(_) => break,
                };
                let Message::Text(text) = frame else { continue };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let Some(id) = value.get("id").and_then(Value::as_u64) else {
                    debug!(method = ?value.get("method"), "dropped cdp event");
                    continue;
                };
                if let Some((_, tx)) = reader_pending.remove(&id) {
                    let result = if let Some(err) = value.get("error") {
                        Err(DriverError::Protocol(err.to_string()))
                    } else {
                        Ok(value.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = tx.send(result);
                }
            }
            reader_pending.clear();
        });

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            rpc_timeout,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = json!({ "id": id, "method": method, "params": params });
        let text =
            serde_json::to_string(&request).map_err(|e| DriverError::Protocol(e.to_string()))?;
        if self.outbound.send(Message::Text(text)).is_err() {
            self.pending.remove(&id);
            return Err(DriverError::Disconnected);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(DriverError::Timeout)
            }
        }
    }

    async fn init_session(&self, width: u32, height: u32) -> Result<(), DriverError> {
        self.call("Page.enable", json!({})).await?;
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({ "width": width, "height": height, "deviceScaleFactor": 1, "mobile": true }),
        )
        .await?;
        self.call(
            "Network.setUserAgentOverride",
            json!({ "userAgent": MOBILE_USER_AGENT }),
        )
        .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str, deadline: Duration) -> Result<NavigateOutcome, DriverError> {
        let navigated = self.call("Page.navigate", json!({ "url": url }));
        match tokio::time::timeout(deadline, navigated).await {
            Ok(result) => result.map(|_| NavigateOutcome::Complete),
            Err(_) => Ok(NavigateOutcome::Partial),
        }
    }

    pub async fn click(&self, x: i32, y: i32) -> Result<(), DriverError> {
        for kind in ["mousePressed", "mouseReleased"] {
            self.call(
                "Input.dispatchMouseEvent",
                json!({ "type": kind, "x": x, "y": y, "button": "left", "clickCount": 1 }),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn scroll(&self, x: i32, y: i32, delta_x: i32, delta_y: i32) -> Result<(), DriverError> {
        self.call(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseWheel", "x": x, "y": y, "deltaX": delta_x, "deltaY": delta_y }),
        )
        .await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<(), DriverError> {
        for ch in text.chars() {
            self.call(
                "Input.dispatchKeyEvent",
                json!({ "type": "char", "text": ch.to_string() }),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn press_key(&self, name: &str) -> Result<(), DriverError> {
        if !NAMED_KEYS.contains(&name) {
            return Err(DriverError::UnknownKey(name.to_string()));
        }
        for kind in ["keyDown", "keyUp"] {
            self.call("Input.dispatchKeyEvent", json!({ "type": kind, "key": name }))
                .await?;
        }
        Ok(())
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<(), DriverError> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({ "width": width, "height": height, "deviceScaleFactor": 1, "mobile": true }),
        )
        .await?;
        Ok(())
    }

    /// Fastest available still capture: a surface-level screenshot that
    /// bypasses any disk intermediate and the full-page rendering path.
    /// Falls back to a plain page screenshot if the surface path is
    /// rejected (older debugging-protocol implementations lack it).
    pub async fn capture_frame(&self) -> Result<Vec<u8>, DriverError> {
        let fast = self
            .call(
                "Page.captureScreenshot",
                json!({
                    "format": "jpeg",
                    "quality": CAPTURE_QUALITY,
                    "fromSurface": true,
                    "captureBeyondViewport": false,
                }),
            )
            .await;

        let result = match fast {
            Ok(value) => value,
            Err(_) => {
                self.call(
                    "Page.captureScreenshot",
                    json!({ "format": "jpeg", "quality": CAPTURE_QUALITY }),
                )
                .await?
            }
        };

        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Protocol("captureScreenshot response missing data".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| DriverError::Protocol(e.to_string()))
    }

    pub async fn close(&self) -> Result<(), DriverError> {
        let _ = self.call("Page.close", json!({})).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn named_keys_reject_unknown() {
        assert!(!NAMED_KEYS.contains(&"F13"));
        assert!(NAMED_KEYS.contains(&"Enter"));
    }
}
