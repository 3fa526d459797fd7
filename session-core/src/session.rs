use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::driver::{BrowserDriver, NavigateOutcome};
use crate::error::{AppError, AppResult};
use crate::transport::PeerTransport;

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Creating,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// One command dispatched into a Session's single-worker mailbox. Every
/// method on `SessionHandle` enqueues one of these instead of touching the
/// driver directly, so driver access is race-free without coarse locking.
enum Command {
    Navigate {
        url: String,
        deadline: Duration,
        respond: oneshot::Sender<AppResult<NavigateOutcome>>,
    },
    Click {
        x: i32,
        y: i32,
        respond: oneshot::Sender<AppResult<()>>,
    },
    Scroll {
        x: i32,
        y: i32,
        delta_x: i32,
        delta_y: i32,
        respond: oneshot::Sender<AppResult<()>>,
    },
    TypeText {
        text: String,
        respond: oneshot::Sender<AppResult<()>>,
    },
    PressKey {
        name: String,
        respond: oneshot::Sender<AppResult<()>>,
    },
    Resize {
        width: u32,
        height: u32,
        respond: oneshot::Sender<AppResult<()>>,
    },
    CaptureFrame {
        respond: oneshot::Sender<AppResult<Vec<u8>>>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

/// A cheaply-cloneable, non-owning reference to a live Session. The Session
/// Pool holds the canonical copy; Peer Transports hold their bound
/// Session's id and look the handle up through the pool rather than storing
/// a raw reference — see the pool-lookup note in `pool.rs`.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    created_at: DateTime<Utc>,
    viewport: RwLock<Viewport>,
    current_url: RwLock<Option<String>>,
    status: RwLock<SessionStatus>,
    last_activity: AtomicI64,
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    subscribers: DashMap<String, Weak<PeerTransport>>,
    command_tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn viewport(&self) -> Viewport {
        *self.inner.viewport.read().unwrap()
    }

    pub fn current_url(&self) -> Option<String> {
        self.inner.current_url.read().unwrap().clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.read().unwrap()
    }

    pub fn last_activity(&self) -> i64 {
        self.inner.last_activity.load(Ordering::Relaxed)
    }

    pub fn idle_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.last_activity()
    }

    pub fn frame_counters(&self) -> (u64, u64) {
        (
            self.inner.frames_captured.load(Ordering::Relaxed),
            self.inner.frames_skipped.load(Ordering::Relaxed),
        )
    }

    pub fn record_frame_captured(&self) {
        self.inner.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_skipped(&self) {
        self.inner.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.inner
            .last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn add_subscriber(&self, peer_id: String, peer: &Arc<PeerTransport>) {
        self.inner.subscribers.insert(peer_id, Arc::downgrade(peer));
        self.touch();
    }

    pub fn remove_subscriber(&self, peer_id: &str) {
        self.inner.subscribers.remove(peer_id);
    }

    /// Live (non-dropped) subscriber handles, pruning dead weak refs as a
    /// side effect. Cheap snapshot, never holds a lock across an await.
    pub fn live_subscribers(&self) -> Vec<Arc<PeerTransport>> {
        let mut dead = Vec::new();
        let mut live = Vec::new();
        for entry in self.inner.subscribers.iter() {
            match entry.value().upgrade() {
                Some(peer) => live.push(peer),
                None => dead.push(entry.key().clone()),
            }
        }
        for id in dead {
            self.inner.subscribers.remove(&id);
        }
        live
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        self.touch();
        self.inner
            .command_tx
            .send(command)
            .await
            .map_err(|_| AppError::Internal("session worker gone".into()))
    }

    pub async fn navigate(&self, url: String, deadline: Duration) -> AppResult<NavigateOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Navigate { url: url.clone(), deadline, respond: tx })
            .await?;
        let outcome = rx
            .await
            .map_err(|_| AppError::Internal("session worker dropped response".into()))??;
        *self.inner.current_url.write().unwrap() = Some(url);
        Ok(outcome)
    }

    pub async fn click(&self, x: i32, y: i32) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Click { x, y, respond: tx }).await?;
        rx.await.map_err(|_| AppError::Internal("session worker dropped response".into()))?
    }

    pub async fn scroll(&self, x: i32, y: i32, delta_x: i32, delta_y: i32) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Scroll { x, y, delta_x, delta_y, respond: tx }).await?;
        rx.await.map_err(|_| AppError::Internal("session worker dropped response".into()))?
    }

    pub async fn type_text(&self, text: String) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::TypeText { text, respond: tx }).await?;
        rx.await.map_err(|_| AppError::Internal("session worker dropped response".into()))?
    }

    pub async fn press_key(&self, name: String) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::PressKey { name, respond: tx }).await?;
        rx.await.map_err(|_| AppError::Internal("session worker dropped response".into()))?
    }

    pub async fn resize(&self, width: u32, height: u32) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Resize { width, height, respond: tx }).await?;
        rx.await.map_err(|_| AppError::Internal("session worker dropped response".into()))??;
        *self.inner.viewport.write().unwrap() = Viewport { width, height };
        Ok(())
    }

    pub async fn capture_frame(&self) -> AppResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::CaptureFrame { respond: tx }).await?;
        rx.await.map_err(|_| AppError::Internal("session worker dropped response".into()))?
    }

    /// Begins the closing sequence: transitions to `closing` so peers
    /// observe it on their next touch (see the shutdown re-entrancy note in
    /// `pool.rs`), tears the driver down within `shutdown_budget`, then
    /// marks the session `closed`.
    pub async fn close(&self, shutdown_budget: Duration) {
        {
            let mut status = self.inner.status.write().unwrap();
            if *status == SessionStatus::Closing || *status == SessionStatus::Closed {
                return;
            }
            *status = SessionStatus::Closing;
        }

        for peer in self.live_subscribers() {
            peer.close().await;
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.command_tx.send(Command::Shutdown { respond: tx }).await.is_ok() {
            if tokio::time::timeout(shutdown_budget, rx).await.is_err() {
                warn!(session = %self.id(), "driver did not acknowledge shutdown within budget");
            }
        }

        *self.inner.status.write().unwrap() = SessionStatus::Closed;
    }

    pub(crate) fn mark_ready(&self) {
        *self.inner.status.write().unwrap() = SessionStatus::Ready;
    }
}

/// Spawns a Session's worker task, which owns the driver connection
/// exclusively and processes commands FIFO. Returns the handle callers use
/// to enqueue work.
pub async fn spawn(
    id: String,
    viewport: Viewport,
    config: Arc<Config>,
) -> AppResult<SessionHandle> {
    let rpc_timeout = Duration::from_secs(config.navigation_deadline_seconds);
    let driver = BrowserDriver::new_session(
        &config.browser_http_base,
        viewport.width,
        viewport.height,
        rpc_timeout,
    )
    .await
    .map_err(AppError::from)?;

    let (command_tx, mut command_rx) = mpsc::channel::<Command>(256);

    let handle = SessionHandle {
        inner: Arc::new(SessionInner {
            id: id.clone(),
            created_at: Utc::now(),
            viewport: RwLock::new(viewport),
            current_url: RwLock::new(None),
            status: RwLock::new(SessionStatus::Creating),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
            frames_captured: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            subscribers: DashMap::new(),
            command_tx,
        }),
    };

    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Navigate { url, deadline, respond } => {
                    let result = driver.navigate(&url, deadline).await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::Click { x, y, respond } => {
                    let result = driver.click(x, y).await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::Scroll { x, y, delta_x, delta_y, respond } => {
                    let result = driver.scroll(x, y, delta_x, delta_y).await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::TypeText { text, respond } => {
                    let result = driver.type_text(&text).await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::PressKey { name, respond } => {
                    let result = driver.press_key(&name).await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::Resize { width, height, respond } => {
                    let result = driver.resize(width, height).await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::CaptureFrame { respond } => {
                    let result = driver.capture_frame().await.map_err(AppError::from);
                    let _ = respond.send(result);
                }
                Command::Shutdown { respond } => {
                    if let Err(err) = driver.close().await {
                        error!(%err, "error tearing down driver");
                    }
                    let _ = respond.send(());
                    break;
                }
            }
        }
        info!("session worker exiting");
    });

    handle.mark_ready();
    crate::frame_source::spawn(handle.clone(), config.framerate);
    crate::audio_source::spawn(handle.clone(), config);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn session_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }
}
