//! Counts queued and in-flight work so callers can wait for quiescence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct WorkTracker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicUsize,
    notify: Notify,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A unit of work was queued.
    pub fn begin(&self) {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// A unit of work finished (or was dropped).
    pub fn finish(&self) {
        let previous = self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "finish without begin");
        self.inner.notify.notify_waiters();
    }

    /// Wake waiters so they re-check their condition.
    pub fn poke(&self) {
        self.inner.notify.notify_waiters();
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until `ready` holds. It is checked whenever work finishes or
    /// someone pokes the tracker.
    pub async fn wait_until(&self, mut ready: impl FnMut(&Self) -> bool) {
        loop {
            let notified = self.inner.notify.notified();
            if ready(self) {
                return;
            }
            notified.await;
        }
    }

    /// Wait until nothing is outstanding.
    pub async fn wait_idle(&self) {
        self.wait_until(|t| t.outstanding() == 0).await
    }
}
