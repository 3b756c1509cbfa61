//! One-shot latch signals.
//!
//! Shutdown sequencing and select cancellation are driven by latches
//! that start unset and can be set exactly once. Closed-channel
//! semantics (observable by any number of parties, before or after the
//! fact) map onto a `tokio::sync::watch` pair.

use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot latch: starts unset, can be set once, and any number of
/// tasks can check or await it.
///
/// Cloning is cheap; all clones observe the same latch.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Create a new, unset signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the signal. Further calls have no effect.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is set. Returns immediately if it already
    /// is. Cancel-safe.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for fails only when the sender is dropped, which cannot
        // happen while we hold an Arc to it.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
