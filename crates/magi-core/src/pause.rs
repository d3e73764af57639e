use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Process-wide pause gate.
///
/// Pause does not cancel in-flight provider calls; it blocks new ones.
/// Providers (via the runner) await `wait_until_running` before every
/// request.  Pause and resume are idempotent.
#[derive(Clone)]
pub struct PauseController {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true when the state actually changed.
    pub fn pause(&self) -> bool {
        let changed = !*self.tx.borrow();
        if changed {
            info!("system paused");
            self.tx.send_replace(true);
        }
        changed
    }

    /// Returns true when the state actually changed.
    pub fn resume(&self) -> bool {
        let changed = *self.tx.borrow();
        if changed {
            info!("system resumed");
            self.tx.send_replace(false);
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the system is not paused.  Returns immediately when
    /// already running.
    pub async fn wait_until_running(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow() {
                return;
            }
            // The sender lives in self, so changed() cannot error here.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
