//! Periodic re-emission of active-request counts.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::shutdown::StopSignal;

use super::enforcer::Enforcer;

/// Joins the refresh thread on drop.
pub struct RefreshHandle {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.stop.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the refresh task: every `refresh_interval_ms` it scans the
/// user-limit table and re-emits `active_reqs` events, so the store's
/// TTL expiry converges to reality when an instance goes quiet or away.
pub fn spawn_refresh(enforcer: Arc<Enforcer>, stop: Arc<StopSignal>) -> RefreshHandle {
    let interval = Duration::from_millis(enforcer.config().refresh_interval_ms);
    let thread_stop = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        while !thread_stop.wait_timeout(interval) {
            enforcer.emit_active_request_refresh();
        }
    });
    RefreshHandle { stop, handle: Some(handle) }
}
