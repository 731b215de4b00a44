//! Abort signal shared between a run and whoever may stop it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Aborts a run. Held by the operator side and by the scheduler, which
/// cancels it itself under fail-fast.
///
/// Only the first reason is kept. Share it with `Arc`.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an abort. Returns true if this call cancelled the token,
    /// false if it already was.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason.into());
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    /// Returns whether an abort was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the reason given to the first `cancel` call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        // A `Notified` receives `notify_waiters` from the moment it exists.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
