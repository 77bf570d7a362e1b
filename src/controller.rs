// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error, not_found_error};
use log::{debug, info, warn};

use crate::abstract_camera::{AbstractCamera, CameraApi, CaptureMode, DeviceInfo,
                             DriverError, PropertyId};
use crate::acquisition_state::{AcquisitionState, Operation};
use crate::capture_loop::{CaptureLoopHandle, LoopExit};
use crate::display::{DisplaySink, FrameRenderer, Status, StatusSink};
use crate::frame_rate::FrameRateStats;
use crate::lut::LutWindow;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Device to open, w.r.t. the device count returned by init().
    pub camera_index: i32,
    /// Number of frames in the ring buffer allocated at capture start.
    pub frame_count: i32,
    /// Initial LUT window. Clamped to the camera's range once its bit depth
    /// is known.
    pub lut_min: u32,
    pub lut_max: u32,
    /// Bounds each blocking wait of the capture loop, and hence how long an
    /// abort can take to be noticed in the worst case.
    pub wait_timeout: Duration,
    /// How long stop() lets the capture loop drain before aborting it.
    pub stop_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig{
            camera_index: 0,
            frame_count: 3,
            lut_min: 0,
            lut_max: u16::MAX as u32,
            wait_timeout: Duration::from_millis(1000),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// Drives one camera through its acquisition lifecycle. Each operation is
/// checked against the current AcquisitionState; an operation invoked in the
/// wrong state is reported as an internal error and changes nothing.
///
/// Every outcome is also reported to the status sink, in the one line form
/// shown to the user. Windowed frames go to the display sink, both from the
/// capture loop and when the LUT window changes.
pub struct AcquisitionController {
    api: Arc<dyn CameraApi>,
    config: ControllerConfig,
    state: AcquisitionState,

    // Present in Opened, Acquiring and Acquired.
    camera: Option<Arc<dyn AbstractCamera>>,

    lut: Arc<Mutex<LutWindow>>,
    renderer: Arc<FrameRenderer>,
    status: Arc<dyn StatusSink>,
    stats: Arc<Mutex<FrameRateStats>>,

    // Present from capture start until we leave Acquiring.
    capture_loop: Option<CaptureLoopHandle>,
}

impl AcquisitionController {
    pub fn new(api: Arc<dyn CameraApi>,
               config: ControllerConfig,
               display: Arc<dyn DisplaySink>,
               status: Arc<dyn StatusSink>) -> Self {
        let mut lut = LutWindow::new(16);
        lut.set_min(config.lut_min);
        lut.set_max(config.lut_max);
        let lut = Arc::new(Mutex::new(lut));
        let renderer = Arc::new(FrameRenderer::new(lut.clone(), display, status.clone()));
        AcquisitionController{
            api,
            config,
            state: AcquisitionState::Startup,
            camera: None,
            lut,
            renderer,
            status,
            stats: Arc::new(Mutex::new(FrameRateStats::new())),
            capture_loop: None,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Whether `op` is currently available, e.g. for enabling a UI control.
    pub fn permits(&self, op: Operation) -> bool {
        self.state.permits(op)
    }

    pub fn lut_window(&self) -> LutWindow {
        *self.lut.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the statistics of the current (or most recent) capture.
    pub fn frame_rate(&self) -> FrameRateStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// True while a capture loop exists and has not exited.
    pub fn is_capture_loop_running(&self) -> bool {
        self.capture_loop.as_ref().is_some_and(|l| !l.is_finished())
    }

    /// Returns the driver's device count.
    pub async fn init(&mut self) -> Result<i32, CanonicalError> {
        self.check_precondition(Operation::Init).await?;
        match self.api.init() {
            Ok(count) => {
                info!("Driver found {} device(s)", count);
                self.report_ok("init()");
                self.complete(Operation::Init).await;
                Ok(count)
            },
            Err(e) => Err(self.driver_failure("init()", e)),
        }
    }

    pub async fn uninit(&mut self) -> Result<(), CanonicalError> {
        self.check_precondition(Operation::Uninit).await?;
        if let Err(e) = self.api.uninit() {
            return Err(self.driver_failure("uninit()", e));
        }
        self.report_ok("uninit()");
        self.complete(Operation::Uninit).await;
        Ok(())
    }

    pub async fn open(&mut self) -> Result<(), CanonicalError> {
        self.check_precondition(Operation::Open).await?;
        let operation = format!("open({})", self.config.camera_index);
        let camera = match self.api.open(self.config.camera_index) {
            Ok(c) => c,
            Err(e) => return Err(self.driver_failure(&operation, e)),
        };
        self.camera = Some(camera);
        self.report_ok(&operation);
        self.refresh_lut(false);
        self.complete(Operation::Open).await;
        Ok(())
    }

    /// Closes the device, terminating any capture loop first.
    pub async fn close(&mut self) -> Result<(), CanonicalError> {
        let camera = self.session_for(Operation::Close).await?;
        if let Some(capture_loop) = self.capture_loop.take() {
            capture_loop.abort_and_join().await;
        }
        if let Err(e) = camera.close() {
            return Err(self.driver_failure("close()", e));
        }
        self.camera = None;
        self.renderer.forget();
        self.report_ok("close()");
        self.complete(Operation::Close).await;
        Ok(())
    }

    pub async fn info(&mut self) -> Result<DeviceInfo, CanonicalError> {
        let camera = self.session_for(Operation::Info).await?;
        camera.model_info().map_err(|e| self.driver_failure("model_info()", e))
    }

    pub async fn get_property(&mut self, id: PropertyId) -> Result<f64, CanonicalError> {
        let camera = self.session_for(Operation::GetProperty).await?;
        camera.get_property(id)
            .map_err(|e| self.driver_failure(&format!("get_property({:?})", id), e))
    }

    /// Returns the value the device actually applied. Changing the bit depth
    /// re-derives the LUT window.
    pub async fn set_property(&mut self, id: PropertyId, value: f64)
                              -> Result<f64, CanonicalError> {
        let camera = self.session_for(Operation::SetProperty).await?;
        let operation = format!("set_property({:?}, {})", id, value);
        let applied = match camera.set_property(id, value) {
            Ok(v) => v,
            Err(e) => return Err(self.driver_failure(&operation, e)),
        };
        self.report_ok(&operation);
        if id == PropertyId::BitsPerChannel {
            self.refresh_lut(true);
        }
        Ok(applied)
    }

    /// Starts a Snap or Sequence capture. From Opened, the ring buffer is
    /// allocated first; from Acquired the existing buffer is reused. If the
    /// capture cannot be started the buffer is released and we return to
    /// Opened.
    pub async fn start(&mut self, mode: CaptureMode) -> Result<(), CanonicalError> {
        let camera = self.session_for(Operation::StartCapture).await?;
        let mut text = String::new();
        if self.state == AcquisitionState::Opened {
            let operation = format!("allocate_buffer({})", self.config.frame_count);
            if let Err(e) = camera.allocate_buffer(self.config.frame_count) {
                return Err(self.driver_failure(&operation, e));
            }
            self.refresh_lut(false);
            text = operation + " && ";
        }

        self.stats.lock().unwrap_or_else(PoisonError::into_inner).reset();
        let operation = format!("start_capture({})", mode);
        if let Err(e) = camera.start_capture(mode) {
            let err = self.driver_failure(&operation, e);
            if let Err(e) = camera.release_buffer() {
                warn!("Could not release buffer after failed start: {}", e);
            }
            self.renderer.forget();
            self.enter_state(AcquisitionState::Opened).await;
            return Err(err);
        }
        self.report_ok(&(text + &operation));
        self.capture_loop = Some(CaptureLoopHandle::start(
            camera, self.renderer.clone(), self.stats.clone(),
            self.config.wait_timeout));
        self.complete(Operation::StartCapture).await;
        Ok(())
    }

    /// Stops capture and joins the capture loop. Lands in Acquired with the
    /// buffer still allocated, however many frames were captured.
    pub async fn stop(&mut self) -> Result<(), CanonicalError> {
        let camera = self.session_for(Operation::StopCapture).await?;
        if let Err(e) = camera.stop_capture() {
            return Err(self.driver_failure("stop_capture()", e));
        }
        if let Some(capture_loop) = self.capture_loop.take() {
            let exit = capture_loop.stop(self.config.stop_grace).await;
            debug!("Capture loop joined: {}", exit);
        }
        self.report_ok("stop_capture()");
        self.complete(Operation::StopCapture).await;
        Ok(())
    }

    pub async fn fire_trigger(&mut self) -> Result<(), CanonicalError> {
        let camera = self.session_for(Operation::FireTrigger).await?;
        if let Err(e) = camera.fire_trigger() {
            return Err(self.driver_failure("fire_trigger()", e));
        }
        self.report_ok("fire_trigger()");
        Ok(())
    }

    pub async fn release_buffer(&mut self) -> Result<(), CanonicalError> {
        let camera = self.session_for(Operation::ReleaseBuffer).await?;
        if let Err(e) = camera.release_buffer() {
            return Err(self.driver_failure("release_buffer()", e));
        }
        self.renderer.forget();
        self.report_ok("release_buffer()");
        self.complete(Operation::ReleaseBuffer).await;
        Ok(())
    }

    /// Waits up to `timeout` for the capture loop to exit by itself, as it
    /// does when a Snap capture completes. The state stays Acquiring until
    /// stop() is called. Returns None if there is no loop or it is still
    /// running.
    pub async fn wait_for_capture_end(&mut self, timeout: Duration) -> Option<LoopExit> {
        self.capture_loop.as_mut()?.wait(timeout).await
    }

    /// Sets the lower bound of the LUT window and redraws the current frame.
    /// Values above the camera's maximum are clamped; returns whether that
    /// happened. An inverted window is reported to the status sink as a
    /// configuration error and blanks the display.
    pub fn set_lut_min(&self, min: u32) -> Result<bool, CanonicalError> {
        let window = {
            let mut lut = self.lut.lock().unwrap_or_else(PoisonError::into_inner);
            let clamped = lut.set_min(min);
            (clamped, *lut)
        };
        self.apply_lut_change(window)
    }

    /// As set_lut_min(), for the upper bound.
    pub fn set_lut_max(&self, max: u32) -> Result<bool, CanonicalError> {
        let window = {
            let mut lut = self.lut.lock().unwrap_or_else(PoisonError::into_inner);
            let clamped = lut.set_max(max);
            (clamped, *lut)
        };
        self.apply_lut_change(window)
    }

    fn apply_lut_change(&self, (clamped, window): (bool, LutWindow))
                        -> Result<bool, CanonicalError> {
        if clamped {
            debug!("LUT window clamped to {}..{}", window.min(), window.max());
        }
        // With a retained frame, the renderer reports a bad window itself.
        let had_frame = self.renderer.has_frame();
        self.renderer.update_picture();
        if let Err(e) = window.validate() {
            if !had_frame {
                self.report(&Status::ConfigError(e.clone()));
            }
            return Err(e.into());
        }
        Ok(clamped)
    }

    // Re-derives the LUT window from the device's bit depth, redrawing if
    // asked to or if the window had to be clamped.
    fn refresh_lut(&self, mut redraw: bool) {
        let Some(camera) = self.camera.as_ref() else {
            return;
        };
        let bits = match camera.get_property(PropertyId::BitsPerChannel) {
            Ok(b) => b,
            Err(e) => {
                warn!("Could not read bits per channel: {}", e);
                return;
            },
        };
        {
            let mut lut = self.lut.lock().unwrap_or_else(PoisonError::into_inner);
            if lut.set_bits_per_pixel(bits as u32) {
                debug!("LUT window clamped to {}..{}", lut.min(), lut.max());
                redraw = true;
            }
        }
        if redraw {
            self.renderer.update_picture();
        }
    }

    // Verifies that `op` is permitted now. On failure reports an internal
    // error and, if the recorded state claims a session we don't have, falls
    // back to Initialized.
    async fn check_precondition(&mut self, op: Operation) -> Result<(), CanonicalError> {
        let needs_session = !matches!(op, Operation::Init | Operation::Uninit |
                                      Operation::Open);
        if needs_session && self.camera.is_none() {
            let message = format!("{} requires an open device", op);
            self.report(&Status::InternalError(message.clone()));
            if self.state.has_session() {
                self.enter_state(AcquisitionState::Initialized).await;
            }
            return Err(failed_precondition_error(&message));
        }
        if op == Operation::Open && self.camera.is_some() {
            let message = "device is already open".to_string();
            self.report(&Status::InternalError(message.clone()));
            return Err(failed_precondition_error(&message));
        }
        if !self.state.permits(op) {
            let message = format!("{} is only available in {:?}, not {}",
                                  op, AcquisitionState::permitted_states(op),
                                  self.state);
            self.report(&Status::InternalError(message.clone()));
            return Err(failed_precondition_error(&message));
        }
        Ok(())
    }

    // As check_precondition(), for operations that run against the open
    // device.
    async fn session_for(&mut self, op: Operation)
                         -> Result<Arc<dyn AbstractCamera>, CanonicalError> {
        self.check_precondition(op).await?;
        self.camera.clone().ok_or_else(|| failed_precondition_error("no open device"))
    }

    // Moves to the state that `op`, which has just succeeded, leads to.
    async fn complete(&mut self, op: Operation) {
        match self.state.after(op) {
            Some(state) => self.enter_state(state).await,
            None => warn!("{} completed in {}, which does not permit it", op, self.state),
        }
    }

    // Entering Initialized or Opened terminates the capture loop before
    // returning. Transitions outside the table (the rollback of a failed
    // start, falling back when the session is lost) come here directly.
    async fn enter_state(&mut self, state: AcquisitionState) {
        if state.is_idle() {
            if let Some(capture_loop) = self.capture_loop.take() {
                let exit = capture_loop.abort_and_join().await;
                debug!("Capture loop joined: {}", exit);
            }
        }
        if state != self.state {
            info!("Acquisition state {} -> {}", self.state, state);
        }
        self.state = state;
    }

    fn report(&self, status: &Status) {
        self.status.report(status);
    }

    fn report_ok(&self, operation: &str) {
        self.report(&Status::Ok(operation.to_string()));
    }

    fn driver_failure(&self, operation: &str, error: DriverError) -> CanonicalError {
        let message = format!("{} failed: {}", operation, error);
        let code = error.code();
        self.report(&Status::DriverError{operation: operation.to_string(), error});
        match code {
            DriverError::NO_CAMERA => not_found_error(&message),
            DriverError::INVALID_PARAM | DriverError::INVALID_VALUE =>
                invalid_argument_error(&message),
            _ => failed_precondition_error(&message),
        }
    }
}

/// We arrange to abort the capture loop and close the device when the
/// controller goes out of scope.
impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if let Some(capture_loop) = self.capture_loop.take() {
            // https://stackoverflow.com/questions/71541765/rust-async-drop
            futures::executor::block_on(capture_loop.abort_and_join());
        }
        if let Some(camera) = self.camera.take() {
            if self.state == AcquisitionState::Acquiring {
                if let Err(e) = camera.stop_capture() {
                    warn!("Could not stop capture: {}", e);
                }
            }
            if let Err(e) = camera.close() {
                warn!("Could not close device: {}", e);
            }
        }
        if self.state != AcquisitionState::Startup {
            if let Err(e) = self.api.uninit() {
                warn!("Could not uninitialize driver: {}", e);
            }
        }
    }
}
