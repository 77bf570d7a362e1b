// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::abstract_camera::{AbstractCamera, CaptureEvents, DriverError,
                             WaitHandle};

/// Why WaitMonitor::start() returned without events.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WaitFailure {
    /// No event within the wait interval. Not an error; retry.
    #[error("timeout")]
    Timeout,
    /// Abort was requested. Terminal; the caller must stop waiting.
    #[error("abort")]
    Abort,
    /// Any other driver failure.
    #[error(transparent)]
    Driver(DriverError),
}

// State shared between the monitor and its abort handles.
#[derive(Default)]
struct AbortState {
    requested: AtomicBool,
    // Present while the monitor holds a live wait handle.
    handle: Mutex<Option<Arc<dyn WaitHandle>>>,
}

/// Requests abort of a WaitMonitor from any thread. Can be created before the
/// monitor itself; an abort requested before the monitor exists is honored by
/// the monitor's first start() call.
#[derive(Clone, Default)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    pub fn new() -> AbortHandle {
        AbortHandle::default()
    }

    /// Causes a blocked (or the next) WaitMonitor::start() to return
    /// WaitFailure::Abort. Idempotent; a no-op once the monitor is released.
    pub fn abort(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
        let handle = self.state.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle.as_ref() {
            handle.abort();
        }
    }

    pub fn is_abort_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }
}

/// Waits for capture events on one device session. The underlying wait handle
/// is disposed when the monitor is dropped.
pub struct WaitMonitor {
    abort: AbortHandle,
    handle: Arc<dyn WaitHandle>,
    timeout: Duration,
}

impl WaitMonitor {
    /// `timeout` bounds each start() call, and thus how long an abort that
    /// races with start() can go unnoticed.
    pub fn new(camera: &dyn AbstractCamera, abort: AbortHandle, timeout: Duration)
               -> Result<WaitMonitor, DriverError> {
        let handle: Arc<dyn WaitHandle> = Arc::from(camera.create_wait_handle()?);
        *abort.state.handle.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(handle.clone());
        Ok(WaitMonitor{abort, handle, timeout})
    }

    /// Blocks until an event in `mask` occurs, the wait times out, or abort
    /// is requested. Returns the events that occurred.
    pub fn start(&self, mask: CaptureEvents) -> Result<CaptureEvents, WaitFailure> {
        if self.abort.is_abort_requested() {
            return Err(WaitFailure::Abort);
        }
        match self.handle.wait(mask, self.timeout) {
            Ok(events) => Ok(events & mask),
            Err(e) if e.is_abort() => Err(WaitFailure::Abort),
            Err(e) if e.is_timeout() => {
                // An abort landing between the check above and the driver
                // entering its wait is picked up here.
                if self.abort.is_abort_requested() {
                    Err(WaitFailure::Abort)
                } else {
                    Err(WaitFailure::Timeout)
                }
            },
            Err(e) => Err(WaitFailure::Driver(e)),
        }
    }
}

impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.abort.state.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        debug!("Wait handle released");
    }
}
