//! Registry of running watchers, drained on shutdown.

use crate::watcher::WatcherHandle;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Tracks every watcher opened in one controller run
#[derive(Debug, Default)]
pub struct WatcherRegistry {
    handles: Mutex<Vec<WatcherHandle>>,
}

impl WatcherRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, Vec<WatcherHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: WatcherHandle) {
        debug!("Registering {}", handle.label());
        self.handles().push(handle);
    }

    /// Cancel and forget every registered watcher.
    ///
    /// Does not wait for the tasks to finish. Handles whose task already
    /// ended are cancelled all the same. Returns how many were drained.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<WatcherHandle> = self.handles().drain(..).collect();
        for handle in &drained {
            debug!("Closing {}", handle.label());
            handle.cancel();
        }
        if !drained.is_empty() {
            info!("Closed {} watchers", drained.len());
        }
        drained.len()
    }

    /// Watchers registered and still running
    pub fn active_count(&self) -> usize {
        self.handles().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }
}
