use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::services::progress::ProgressStore;
use crate::services::session::SessionRegistry;

/// Periodically removes sessions that outlived their retention window:
/// registry entry, storage directory and progress record.
pub struct SessionSweeper {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ProgressStore>,
    ttl: Duration,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SessionSweeper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ProgressStore>,
        ttl: Duration,
        every: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            store,
            ttl,
            every,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Session sweeper started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Session sweeper shutting down");
                    break;
                }
                _ = sleep(self.every) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Returns the number of sessions removed.
    pub async fn sweep(&self) -> usize {
        let expired = self.registry.expired(self.ttl);
        if expired.is_empty() {
            return 0;
        }
        tracing::info!("🧹 Sweeping {} expired session(s)", expired.len());

        let mut removed = 0;
        for session in expired {
            match tokio::fs::remove_dir_all(&session.dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(
                        "Failed to remove storage for session {}: {}",
                        session.token,
                        e
                    );
                    continue;
                }
            }

            if let Err(e) = self.store.remove(session.token.as_str()).await {
                tracing::warn!("Failed to drop progress for session {}: {:?}", session.token, e);
            }

            self.registry.remove(&session.token);
            removed += 1;
        }
        removed
    }
}
