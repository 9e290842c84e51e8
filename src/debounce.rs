//! Keyed debounce timers.
//!
//! One structure serves every schedule-or-ignore use in the controller: mDNS
//! burst coalescing, commissioning-window expiry, and the background scanner
//! and poller timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Schedules at most one pending task per key.
///
/// Cloning is cheap and shares the timer table.
#[derive(Clone, Default)]
pub struct Debouncer {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run after `delay` unless the key already has a
    /// pending timer. Returns false when the call was dropped.
    ///
    /// The timer removes its key before running the payload, so the payload
    /// may re-arm the same key.
    pub fn schedule<F, Fut>(&self, key: &str, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock();
        if timers.get(key).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let table = Arc::clone(&self.timers);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            table.lock().remove(&owned_key);
            task().await;
        });
        timers.insert(key.to_string(), handle);
        true
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers
            .lock()
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel a pending timer. Returns true if one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        if let Some(handle) = self.timers.lock().remove(key) {
            handle.abort();
            return true;
        }
        false
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
