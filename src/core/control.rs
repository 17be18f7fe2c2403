//! Cooperative pause/cancel signaling
//!
//! A [`ControlPlane`] is shared between whoever drives a session and the
//! transfer loop. The loop only looks at it between chunks, so a read that is
//! already in flight always runs to completion (or to its network timeout).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Signals {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

/// Cloneable handle over the pause and cancel signals
#[derive(Debug, Clone, Default)]
pub struct ControlPlane {
    signals: Arc<Signals>,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the transfer at its next chunk boundary
    pub fn pause(&self) {
        self.signals.paused.store(true, Ordering::SeqCst);
    }

    /// Release a paused transfer
    pub fn resume(&self) {
        self.signals.paused.store(false, Ordering::SeqCst);
    }

    /// Stop the transfer at its next chunk boundary
    pub fn cancel(&self) {
        self.signals.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clear both signals
    pub fn reset(&self) {
        self.signals.paused.store(false, Ordering::SeqCst);
        self.signals.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.signals.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.cancelled.load(Ordering::SeqCst)
    }

    /// Block until unpaused or cancelled, polling every `poll`
    pub async fn wait_while_paused(&self, poll: Duration) {
        while self.is_paused() && !self.is_cancelled() {
            tokio::time::sleep(poll).await;
        }
    }
}
