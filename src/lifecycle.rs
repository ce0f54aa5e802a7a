//! Connection tracking and shutdown draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Counts in-flight connections and refuses new ones once shutdown begins.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    active: AtomicUsize,
    shutting_down: AtomicBool,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// Returns `None` once shutdown has begun. The count is decremented when
    /// the guard drops, including on panic.
    pub fn track(&self) -> Option<ConnectionGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        Some(ConnectionGuard {
            state: Arc::clone(&self.inner),
        })
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait for all tracked connections to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        let deadline = Instant::now() + timeout;
        let mut last_log = Instant::now();

        loop {
            let active = self.active_count();

            if active == 0 {
                return DrainResult::Complete;
            }

            if Instant::now() >= deadline {
                warn!(
                    active_connections = active,
                    "Drain timeout exceeded, forcing shutdown"
                );
                return DrainResult::Timeout { remaining: active };
            }

            // Log every 5 seconds
            if last_log.elapsed() >= Duration::from_secs(5) {
                info!(active_connections = active, "Draining connections...");
                last_log = Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Keeps one connection counted while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    state: Arc<TrackerState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of draining connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All connections completed before the deadline
    Complete,
    /// Deadline reached with connections still open
    Timeout { remaining: usize },
}
