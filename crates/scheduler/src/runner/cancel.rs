use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::info;
use vista_core::ViewId;

#[derive(Debug, Default)]
struct CancelState {
    all: AtomicBool,
    subtrees: Mutex<Vec<ViewId>>,
    notify: Notify,
}

/// Cooperative cancellation of a running scheduler.
///
/// Requests are observed by the coordinator before every dispatch decision.
/// `cancel_all` is sticky until [`reset`](CancelHandle::reset); subtree
/// requests apply to the cycle that is running when they arrive and are
/// discarded at the start of the next one.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every view and stop a long-running scheduler.
    pub fn cancel_all(&self) {
        info!("cancellation requested for all views");
        self.inner.all.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    /// Cancel `id` and everything downstream of it.
    pub fn cancel_subtree(&self, id: &ViewId) {
        info!(view = %id, "cancellation requested for subtree");
        self.inner
            .subtrees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.clone());
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.all.load(Ordering::SeqCst)
    }

    /// Clear every pending request.
    pub fn reset(&self) {
        self.inner.all.store(false, Ordering::SeqCst);
        self.take_subtrees();
    }

    pub(crate) fn take_subtrees(&self) -> Vec<ViewId> {
        std::mem::take(&mut *self.inner.subtrees.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Resolves after the next request. A request made while nobody waits
    /// is remembered for the next caller.
    pub(crate) async fn notified(&self) {
        self.inner.notify.notified().await
    }
}
