//! Named background tasks bound to an endpoint's lifetime
//!
//! Controllers are asynchronous reconciliation tasks (identity resolution,
//! external sync) keyed by name. Spawning under an existing name replaces the
//! previous task. Teardown cancels everything so no task outlives its
//! endpoint.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct ControllerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Manager for the background tasks of a single endpoint.
#[derive(Debug, Default)]
pub struct ControllerManager {
    tasks: Mutex<HashMap<String, ControllerHandle>>,
}

impl ControllerManager {
    /// Create a manager with no running controllers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a controller under `name`, cancelling any previous controller
    /// with the same name. The task receives a cancellation token it must
    /// observe.
    pub fn spawn<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        let previous = self
            .tasks
            .lock()
            .insert(name.to_string(), ControllerHandle { cancel, handle });
        if let Some(previous) = previous {
            debug!("replacing controller {name}");
            previous.cancel.cancel();
        }
    }

    /// Cancel and remove the controller with the given name, if running.
    pub fn remove(&self, name: &str) {
        if let Some(handle) = self.tasks.lock().remove(name) {
            handle.cancel.cancel();
        }
    }

    /// Cancel and remove every controller. Called on endpoint teardown.
    ///
    /// Tasks are expected to observe their token promptly; the join handles
    /// are dropped, not awaited.
    pub fn remove_all(&self) {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (name, handle) in drained {
            debug!("stopping controller {name}");
            handle.cancel.cancel();
            drop(handle.handle);
        }
    }

    /// Number of controllers currently registered.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no controllers are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
