// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::task::{JoinError, JoinHandle};

use crate::abstract_camera::{AbstractCamera, CaptureEvents};
use crate::display::FrameRenderer;
use crate::frame_rate::FrameRateStats;
use crate::wait_monitor::{AbortHandle, WaitFailure, WaitMonitor};

// Driver failures (other than timeout and abort) tolerated in a row before the
// loop gives up.
const MAX_CONSECUTIVE_WAIT_FAILURES: u32 = 10;

/// Why the capture loop ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// The device reported that capture stopped.
    Stopped,
    /// Abort was requested.
    Aborted,
    /// The wait primitive could not be created or kept failing.
    Failed,
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Background task that watches one acquisition: it waits for capture events,
/// and routes each newest frame through the renderer to the display. The loop
/// never changes acquisition state; it just exits when capture stops or it is
/// aborted.
pub struct CaptureLoopHandle {
    abort: AbortHandle,
    // None once joined.
    task: Option<JoinHandle<LoopExit>>,
    exit: Option<LoopExit>,
}

impl CaptureLoopHandle {
    /// Spawns the loop on tokio's blocking thread pool. Must be called from
    /// within a tokio runtime.
    pub fn start(camera: Arc<dyn AbstractCamera>,
                 renderer: Arc<FrameRenderer>,
                 stats: Arc<Mutex<FrameRateStats>>,
                 wait_timeout: Duration) -> CaptureLoopHandle {
        let abort = AbortHandle::new();
        let cloned_abort = abort.clone();
        let task = tokio::task::spawn_blocking(move || {
            run_capture_loop(camera.as_ref(), &renderer, &stats, cloned_abort,
                             wait_timeout)
        });
        CaptureLoopHandle{abort, task: Some(task), exit: None}
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Waits up to `timeout` for the loop to exit by itself. Returns None if it
    /// is still running.
    pub async fn wait(&mut self, timeout: Duration) -> Option<LoopExit> {
        if let Some(task) = self.task.as_mut() {
            let result = tokio::time::timeout(timeout, task).await.ok()?;
            self.task = None;
            self.exit = Some(exit_reason(result));
        }
        self.exit
    }

    /// Gives the loop `grace` to exit by itself (as it does once the device
    /// reports capture stopped), then aborts it.
    pub async fn stop(mut self, grace: Duration) -> LoopExit {
        if let Some(exit) = self.wait(grace).await {
            return exit;
        }
        debug!("Capture loop still running after {:?}, aborting", grace);
        self.abort_and_join().await
    }

    pub async fn abort_and_join(mut self) -> LoopExit {
        self.abort.abort();
        match self.task.take() {
            Some(task) => exit_reason(task.await),
            None => self.exit.unwrap_or(LoopExit::Failed),
        }
    }
}

/// A handle dropped without being joined still terminates its loop.
impl Drop for CaptureLoopHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.abort.abort();
        }
    }
}

fn exit_reason(result: Result<LoopExit, JoinError>) -> LoopExit {
    match result {
        Ok(exit) => exit,
        Err(e) => {
            error!("Capture loop did not complete: {}", e);
            LoopExit::Failed
        },
    }
}

fn run_capture_loop(camera: &dyn AbstractCamera,
                    renderer: &FrameRenderer,
                    stats: &Mutex<FrameRateStats>,
                    abort: AbortHandle,
                    wait_timeout: Duration) -> LoopExit {
    let monitor = match WaitMonitor::new(camera, abort, wait_timeout) {
        Ok(m) => m,
        Err(e) => {
            error!("Could not create wait handle: {}", e);
            return LoopExit::Failed;
        },
    };
    info!("Capture loop started");
    let mask = CaptureEvents::FRAME_READY | CaptureEvents::STOPPED;
    let mut consecutive_failures = 0;
    let exit = loop {
        let events = match monitor.start(mask) {
            Ok(events) => events,
            Err(WaitFailure::Timeout) => {
                debug!("No capture event within {:?}", wait_timeout);
                continue;
            },
            Err(WaitFailure::Abort) => break LoopExit::Aborted,
            Err(WaitFailure::Driver(e)) => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_WAIT_FAILURES {
                    error!("Wait failed {} times in a row, last: {}",
                           consecutive_failures, e);
                    break LoopExit::Failed;
                }
                warn!("Wait failed: {}", e);
                continue;
            },
        };
        consecutive_failures = 0;

        // Show the frame before honoring a stop reported in the same batch.
        if events.contains(CaptureEvents::FRAME_READY) {
            process_newest_frame(camera, renderer, stats);
        }
        if events.contains(CaptureEvents::STOPPED) {
            break LoopExit::Stopped;
        }
    };
    info!("Capture loop exiting: {}", exit);
    exit
}

fn process_newest_frame(camera: &dyn AbstractCamera,
                        renderer: &FrameRenderer,
                        stats: &Mutex<FrameRateStats>) {
    let transfer = match camera.newest_frame_info() {
        Ok(t) => t,
        Err(e) => {
            warn!("Could not get newest frame info: {}", e);
            return;
        },
    };
    stats.lock().unwrap_or_else(PoisonError::into_inner)
        .record_frame_ready(transfer.frame_count, Instant::now());
    if transfer.newest_frame_index < 0 {
        return;
    }
    match renderer.update_image(camera, transfer.newest_frame_index) {
        Ok(true) => {
            stats.lock().unwrap_or_else(PoisonError::into_inner).record_displayed();
        },
        Ok(false) => (),
        Err(e) => {
            warn!("Could not lock frame {}: {}", transfer.newest_frame_index, e);
        },
    }
}
