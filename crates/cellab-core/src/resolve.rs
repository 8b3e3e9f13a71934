//! Single-assignment completion signal shared by racing tasks.
//!
//! The engine callback, the watchdog and a stop request all try to
//! resolve the same iteration, from different tasks and threads. The first
//! `resolve` wins via compare-and-set; every later call is a no-op and
//! reports that it lost.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

pub struct ResolveOnce<T> {
    claimed: AtomicBool,
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> ResolveOnce<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            claimed: AtomicBool::new(false),
            tx,
        }
    }

    /// Try to resolve with `value`. Returns `true` if this call won.
    pub fn resolve(&self, value: T) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tx.send_replace(Some(value));
        true
    }

    /// Wait for the winning value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so `changed` cannot fail while we
            // hold a reference.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for ResolveOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}
