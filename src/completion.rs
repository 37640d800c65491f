//! Wait group for outstanding proxy configuration changes
//!
//! Producers register a [`Completion`] per queued change; consumers wait for
//! the whole group to drain under a deadline. Dropping a completion without
//! calling [`Completion::complete`] also releases it, so an aborted change
//! can never wedge a waiter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicUsize,
    notify: Notify,
}

/// Tracks a set of in-flight changes that must settle before a caller may
/// observe a consistent proxy state.
#[derive(Clone, Debug, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

impl WaitGroup {
    /// Create an empty wait group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight change.
    pub fn add(&self) -> Completion {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Completion {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of changes still in flight.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait until every registered change has completed, bounded by
    /// `deadline`.
    pub async fn wait(&self, deadline: Duration) -> Result<()> {
        let drained = async {
            loop {
                let notified = self.inner.notify.notified();
                if self.inner.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, drained)
            .await
            .map_err(|_| Error::Proxy("timed out waiting for pending changes".to_string()))
    }
}

/// Handle for a single in-flight change registered with a [`WaitGroup`].
#[derive(Debug)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// Mark the change as applied.
    pub fn complete(self) {
        // Release happens in Drop.
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        self.inner.notify.notify_waiters();
    }
}
