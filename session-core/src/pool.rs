use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::session::{generate_session_id, spawn, SessionHandle, Viewport};

/// Process-wide index of live sessions. This is the only process-wide
/// mutable state in the core; everything else is owned by the Session it
/// belongs to. Guarded by DashMap's per-shard locking rather than one coarse
/// mutex, matching the "short critical section" requirement — no await ever
/// happens while a shard guard is held.
pub struct SessionPool {
    sessions: DashMap<String, SessionHandle>,
    config: Arc<Config>,
}

impl SessionPool {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let pool = Arc::new(Self {
            sessions: DashMap::new(),
            config,
        });
        pool.clone().spawn_reaper();
        pool
    }

    pub async fn create(
        &self,
        id: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
    ) -> AppResult<SessionHandle> {
        let id = id.unwrap_or_else(generate_session_id);
        if self.sessions.contains_key(&id) {
            return Err(AppError::AlreadyExists(id));
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(AppError::AtCapacity);
        }

        let viewport = Viewport {
            width: width.unwrap_or(self.config.video_width),
            height: height.unwrap_or(self.config.video_height),
        };
        let handle = spawn(id.clone(), viewport, self.config.clone()).await?;

        // Re-check capacity/uniqueness after the (suspending) driver bootstrap,
        // since two callers could have raced the check above.
        if self.sessions.contains_key(&id) {
            let shutdown_budget = Duration::from_millis(self.config.shutdown_budget_millis);
            handle.close(shutdown_budget).await;
            return Err(AppError::AlreadyExists(id));
        }

        self.sessions.insert(id.clone(), handle.clone());
        info!(session = %id, "session created");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub async fn close(&self, id: &str) -> AppResult<()> {
        let handle = self
            .sessions
            .remove(id)
            .map(|(_, handle)| handle)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;

        let shutdown_budget = Duration::from_millis(self.config.shutdown_budget_millis);
        handle.close(shutdown_budget).await;
        info!(session = %id, "session closed");
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// Periodic idle reaper. Collects candidate ids first, then closes each
    /// one individually — it never holds the pool-wide index while a
    /// session's (suspending) driver teardown is in flight.
    fn spawn_reaper(self: Arc<Self>) {
        let idle_timeout = self.config.idle_timeout_seconds as i64;
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired: Vec<String> = self
                    .sessions
                    .iter()
                    .filter(|entry| entry.value().idle_seconds() > idle_timeout)
                    .map(|entry| entry.key().clone())
                    .collect();

                for id in expired {
                    info!(session = %id, "reaping idle session");
                    let _ = self.close(&id).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            max_sessions: 2,
            ..Config::default()
        })
    }

    #[test_timeout::timeout]
    fn capacity_is_enforced_by_count() {
        let pool = SessionPool::new(test_config());
        assert_eq!(pool.max_sessions(), 2);
        assert_eq!(pool.active_count(), 0);
    }

    #[test_timeout::timeout]
    fn close_of_unknown_session_is_not_found() {
        let pool = SessionPool::new(test_config());
        assert!(pool.get("missing").is_none());
    }
}
