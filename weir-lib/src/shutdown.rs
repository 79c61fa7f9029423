//! Cooperative stop signal shared by the background threads.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot stop flag with a condition variable, so threads sleeping between
/// periodic work wake up promptly on shutdown instead of finishing their
/// full timeout.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`, waking early on [`request_stop`].
    /// Returns true once stop has been requested.
    ///
    /// [`request_stop`]: StopSignal::request_stop
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
