// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use image::GrayImage;
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::abstract_camera::{AbstractCamera, DriverError, LockedFrame};
use crate::lut::{LutWindow, RescaleError, rescale};

/// Windowed frame ready to be shown.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayImage {
    /// Ring buffer slot the frame came from.
    pub frame_index: i32,
    pub image: GrayImage,
    /// When the device completed the frame.
    pub timestamp: SystemTime,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DisplayUpdate {
    Frame(DisplayImage),
    /// Nothing valid to show; blank the display.
    Clear,
}

/// Receives display updates. Called from the capture loop as well as from the
/// controller, so implementations must not block for long.
pub trait DisplaySink: Send + Sync {
    fn present(&self, update: DisplayUpdate);
}

/// Posts display updates to a channel drained by whoever owns the display.
pub struct ChannelDisplay {
    sender: mpsc::UnboundedSender<DisplayUpdate>,
}

impl DisplaySink for ChannelDisplay {
    fn present(&self, update: DisplayUpdate) {
        // The receiver going away just means nobody is watching.
        let _ = self.sender.send(update);
    }
}

pub fn display_channel() -> (ChannelDisplay, mpsc::UnboundedReceiver<DisplayUpdate>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelDisplay{sender}, receiver)
}

/// Outcome of an operation, in the form shown to the user.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Ok(String),
    DriverError { operation: String, error: DriverError },
    ConfigError(RescaleError),
    InternalError(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Ok(operation) => write!(f, "OK: {}", operation),
            Status::DriverError{operation, error} =>
                write!(f, "NG: 0x{:08X}:{}", error.code(), operation),
            Status::ConfigError(e) => write!(f, "NG: RESCALE: 0x{:08X}", e.code()),
            Status::InternalError(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn report(&self, status: &Status);
}

/// Writes status lines to the log.
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn report(&self, status: &Status) {
        match status {
            Status::Ok(_) => info!("{}", status),
            Status::DriverError{error, ..} => warn!("{} ({})", status, error.message()),
            Status::ConfigError(e) => warn!("{} ({})", status, e),
            Status::InternalError(_) => error!("{}", status),
        }
    }
}

/// Locks frames out of the device, windows them, and hands the result to the
/// display. The most recently locked frame is retained so the picture can be
/// redrawn when the LUT window changes.
pub struct FrameRenderer {
    lut: Arc<Mutex<LutWindow>>,
    display: Arc<dyn DisplaySink>,
    status: Arc<dyn StatusSink>,
    current: Mutex<Option<LockedFrame>>,
}

impl FrameRenderer {
    pub fn new(lut: Arc<Mutex<LutWindow>>,
               display: Arc<dyn DisplaySink>,
               status: Arc<dyn StatusSink>) -> Self {
        FrameRenderer{lut, display, status, current: Mutex::new(None)}
    }

    /// Locks frame `index` of `camera`'s ring buffer and shows it. A failed
    /// lock forgets the current frame and blanks the display. Returns whether
    /// a picture was presented.
    pub fn update_image(&self, camera: &dyn AbstractCamera, index: i32)
                        -> Result<bool, DriverError> {
        match camera.lock_frame(index) {
            Ok(frame) => {
                *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                Ok(self.update_picture())
            },
            Err(e) => {
                self.forget();
                self.display.present(DisplayUpdate::Clear);
                Err(e)
            },
        }
    }

    /// Redraws the current frame through a snapshot of the LUT window. A
    /// rescale failure is reported as a configuration error and blanks the
    /// display. Returns whether a picture was presented.
    pub fn update_picture(&self) -> bool {
        let frame = self.current.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(frame) = frame else {
            self.display.present(DisplayUpdate::Clear);
            return false;
        };
        let window = *self.lut.lock().unwrap_or_else(PoisonError::into_inner);
        match rescale(&frame, &window) {
            Ok(Some(image)) => {
                self.display.present(DisplayUpdate::Frame(
                    DisplayImage{frame_index: frame.index, image,
                                 timestamp: frame.timestamp}));
                true
            },
            Ok(None) => {
                self.display.present(DisplayUpdate::Clear);
                false
            },
            Err(e) => {
                self.display.present(DisplayUpdate::Clear);
                self.status.report(&Status::ConfigError(e));
                false
            },
        }
    }

    /// Drops the retained frame, e.g. when the buffer it came from is
    /// released.
    pub fn forget(&self) {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Whether a locked frame is retained for redrawing.
    pub fn has_frame(&self) -> bool {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Luma};

    use super::*;
    use crate::abstract_camera::{CameraApi, CaptureMode, TriggerSource};
    use crate::image_camera::{CameraOp, ImageCameraApi};

    #[derive(Default)]
    struct RecordingStatus {
        reports: Mutex<Vec<Status>>,
    }

    impl StatusSink for RecordingStatus {
        fn report(&self, status: &Status) {
            self.reports.lock().unwrap().push(status.clone());
        }
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(Status::Ok("open".to_string()).to_string(), "OK: open");
        assert_eq!(Status::DriverError{operation: "start".to_string(),
                                       error: DriverError::timeout()}.to_string(),
                   "NG: 0x80000106:start");
        assert_eq!(Status::ConfigError(RescaleError::InvertedWindow{min: 2, max: 1})
                   .to_string(), "NG: RESCALE: 0x81000001");
        assert_eq!(Status::InternalError("no session".to_string()).to_string(),
                   "Internal Error: no session");
    }

    #[test]
    fn test_channel_display_survives_dropped_receiver() {
        let (display, receiver) = display_channel();
        drop(receiver);
        display.present(DisplayUpdate::Clear);
    }

    #[test]
    fn test_render_and_refresh() {
        let image = ImageBuffer::<Luma<u16>, Vec<u16>>::from_fn(
            4, 1, |x, _| Luma([x as u16 * 100]));
        let api = ImageCameraApi::new(vec![image], 12);
        let device = api.device(0).unwrap();
        device.set_trigger_source(TriggerSource::Software);
        api.init().unwrap();
        let camera = api.open(0).unwrap();
        camera.allocate_buffer(2).unwrap();
        camera.start_capture(CaptureMode::Sequence).unwrap();
        camera.fire_trigger().unwrap();

        let lut = Arc::new(Mutex::new(LutWindow::new(12)));
        lut.lock().unwrap().set_max(300);
        let (display, mut receiver) = display_channel();
        let status = Arc::new(RecordingStatus::default());
        let renderer = FrameRenderer::new(lut.clone(), Arc::new(display), status.clone());

        assert!(renderer.update_image(camera.as_ref(), -1).unwrap());
        match receiver.try_recv().unwrap() {
            DisplayUpdate::Frame(frame) => {
                assert_eq!(frame.frame_index, 0);
                assert_eq!(frame.image.as_raw(), &vec![0, 85, 170, 255]);
            },
            DisplayUpdate::Clear => panic!("expected a frame"),
        }

        // Inverted window blanks the display and reports.
        lut.lock().unwrap().set_min(400);
        assert!(!renderer.update_picture());
        assert_eq!(receiver.try_recv().unwrap(), DisplayUpdate::Clear);
        assert_eq!(status.reports.lock().unwrap()[0],
                   Status::ConfigError(RescaleError::InvertedWindow{min: 400, max: 300}));

        // Failed lock forgets the frame.
        device.inject_failure(CameraOp::LockFrame, DriverError::INVALID_FRAME_INDEX);
        assert_eq!(renderer.update_image(camera.as_ref(), 1).unwrap_err().code(),
                   DriverError::INVALID_FRAME_INDEX);
        assert_eq!(receiver.try_recv().unwrap(), DisplayUpdate::Clear);
        assert!(!renderer.has_frame());
    }
}
