use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Error value returned by every call into the camera driver. Carries the
/// driver's numeric error code so it can be surfaced to the user verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("0x{code:08X}:{message}")]
pub struct DriverError {
    code: u32,
    message: String,
}

impl DriverError {
    pub const BUSY: u32 = 0x8000_0101;
    pub const ABORT: u32 = 0x8000_0102;
    pub const NOT_READY: u32 = 0x8000_0103;
    pub const TIMEOUT: u32 = 0x8000_0106;
    pub const NOT_BUSY: u32 = 0x8000_0107;
    pub const NO_MEMORY: u32 = 0x8000_0203;
    pub const NO_CAMERA: u32 = 0x8000_0206;
    pub const INVALID_HANDLE: u32 = 0x8000_0807;
    pub const INVALID_PARAM: u32 = 0x8000_0808;
    pub const INVALID_VALUE: u32 = 0x8000_0821;
    pub const INVALID_FRAME_INDEX: u32 = 0x8000_0833;
    pub const NOT_SUPPORTED: u32 = 0x8000_0f03;

    pub fn new(code: u32, message: &str) -> DriverError {
        DriverError{code, message: message.to_string()}
    }

    pub fn timeout() -> DriverError {
        DriverError::new(Self::TIMEOUT, "timeout")
    }

    pub fn abort() -> DriverError {
        DriverError::new(Self::ABORT, "abort")
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.code == Self::TIMEOUT
    }

    pub fn is_abort(&self) -> bool {
        self.code == Self::ABORT
    }
}

/// How a capture is run once started.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Captures the allocated number of frames, then stops by itself.
    Snap,
    /// Captures continuously into the ring buffer until stopped.
    Sequence,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

/// Only monochrome cameras are supported.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PixelType {
    #[default]
    None,
    Mono8,
    Mono16,
}

impl PixelType {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelType::None => 0,
            PixelType::Mono8 => 1,
            PixelType::Mono16 => 2,
        }
    }
}

/// Where frame exposures are started from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    Internal,
    Software,
}

/// Properties we read from or write to the device. Values are exchanged as
/// f64 regardless of the property's natural type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyId {
    BitsPerChannel,
    /// Seconds.
    ExposureTime,
    /// 1 = internal, 2 = software (see TriggerSource).
    TriggerSource,
    ImageWidth,
    ImageHeight,
}

impl TriggerSource {
    pub fn as_property_value(&self) -> f64 {
        match self {
            TriggerSource::Internal => 1.0,
            TriggerSource::Software => 2.0,
        }
    }

    pub fn from_property_value(value: f64) -> Option<TriggerSource> {
        match value as i32 {
            1 => Some(TriggerSource::Internal),
            2 => Some(TriggerSource::Software),
            _ => None,
        }
    }
}

/// Set of capture events a wait can be asked for, and that a wait reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureEvents(u32);

impl CaptureEvents {
    pub const NONE: CaptureEvents = CaptureEvents(0);
    pub const FRAME_READY: CaptureEvents = CaptureEvents(0x0002);
    pub const STOPPED: CaptureEvents = CaptureEvents(0x0010);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: CaptureEvents) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CaptureEvents {
    type Output = CaptureEvents;
    fn bitor(self, rhs: CaptureEvents) -> CaptureEvents {
        CaptureEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for CaptureEvents {
    fn bitor_assign(&mut self, rhs: CaptureEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CaptureEvents {
    type Output = CaptureEvents;
    fn bitand(self, rhs: CaptureEvents) -> CaptureEvents {
        CaptureEvents(self.0 & rhs.0)
    }
}

/// Newest completed frame as reported by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferInfo {
    /// Ring buffer slot of the newest frame; -1 if no frame yet.
    pub newest_frame_index: i32,
    /// Number of frames captured since capture start.
    pub frame_count: i32,
}

/// Describes the ring buffer allocated inside the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    pub frame_count: i32,
    pub width: i32,
    pub height: i32,
    pub pixel_type: PixelType,
}

impl FrameBuffer {
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.pixel_type != PixelType::None
    }

    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.pixel_type = PixelType::None;
    }
}

/// One frame locked out of the device's ring buffer. Pixel data is stored in
/// row major order; Mono16 samples are little endian.
#[derive(Clone, Debug)]
pub struct LockedFrame {
    /// Ring buffer slot this frame was locked from.
    pub index: i32,
    pub width: i32,
    pub height: i32,
    pub pixel_type: PixelType,
    /// Bytes from the start of one row to the start of the next.
    pub row_bytes: usize,
    pub data: Arc<Vec<u8>>,
    pub timestamp: SystemTime,
}

impl LockedFrame {
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.pixel_type != PixelType::None
    }
}

/// Static description of an opened device.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub driver_version: String,
    pub bits_per_channel: i32,
}

/// Blocking wait primitive bound to one device session. Dropping the handle
/// disposes of it.
pub trait WaitHandle: Send + Sync {
    /// Blocks until one of the events in `mask` occurs, abort() is called, or
    /// `timeout` elapses. Returns the subset of `mask` that occurred. Timeout
    /// and abort are reported as DriverError::TIMEOUT and DriverError::ABORT.
    fn wait(&self, mask: CaptureEvents, timeout: Duration)
            -> Result<CaptureEvents, DriverError>;

    /// Unblocks a wait() in progress (or the next one, if none is in progress)
    /// with DriverError::ABORT. May be called from any thread.
    fn abort(&self);
}

/// Driver module entry points. The driver must be initialized before any
/// device can be opened.
pub trait CameraApi: Send + Sync {
    /// Returns the number of devices found.
    fn init(&self) -> Result<i32, DriverError>;
    fn uninit(&self) -> Result<(), DriverError>;

    /// `index` is w.r.t. the device count returned by init().
    fn open(&self, index: i32) -> Result<Arc<dyn AbstractCamera>, DriverError>;
}

/// AbstractCamera models one opened session with a monochrome camera whose
/// frames land in a driver-managed ring buffer. All methods take `&self`; the
/// driver is responsible for its own internal synchronization, since frames are
/// locked from the capture thread while the controller starts and stops
/// capture from another.
pub trait AbstractCamera: Send + Sync {
    fn model_info(&self) -> Result<DeviceInfo, DriverError>;

    fn close(&self) -> Result<(), DriverError>;

    // Buffer management.

    /// Allocates a ring buffer holding `frame_count` frames at the current
    /// image size and pixel type.
    fn allocate_buffer(&self, frame_count: i32) -> Result<(), DriverError>;
    fn release_buffer(&self) -> Result<(), DriverError>;

    /// Locks the frame at `index` of the ring buffer. An index of -1 refers
    /// to the newest frame.
    fn lock_frame(&self, index: i32) -> Result<LockedFrame, DriverError>;

    // Capture control.

    fn start_capture(&self, mode: CaptureMode) -> Result<(), DriverError>;
    fn stop_capture(&self) -> Result<(), DriverError>;
    fn fire_trigger(&self) -> Result<(), DriverError>;
    fn newest_frame_info(&self) -> Result<TransferInfo, DriverError>;

    // Properties.

    fn get_property(&self, id: PropertyId) -> Result<f64, DriverError>;
    /// Returns the value actually applied, which might be rounded or clamped.
    fn set_property(&self, id: PropertyId, value: f64) -> Result<f64, DriverError>;

    fn create_wait_handle(&self) -> Result<Box<dyn WaitHandle>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_events() {
        let mask = CaptureEvents::FRAME_READY | CaptureEvents::STOPPED;
        assert!(mask.contains(CaptureEvents::FRAME_READY));
        assert!(mask.contains(CaptureEvents::STOPPED));
        assert!(!CaptureEvents::FRAME_READY.contains(CaptureEvents::STOPPED));
        assert!(!mask.contains(CaptureEvents::NONE));
        assert!((CaptureEvents::FRAME_READY & CaptureEvents::STOPPED).is_empty());
        assert_eq!(mask.bits(), 0x12);
    }

    #[test]
    fn test_frame_buffer_validity() {
        let mut fb = FrameBuffer{frame_count: 3, width: 64, height: 32,
                                 pixel_type: PixelType::Mono16};
        assert!(fb.is_valid());
        fb.clear();
        assert!(!fb.is_valid());
        assert_eq!(fb.frame_count, 3);
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::timeout();
        assert!(err.is_timeout());
        assert!(!err.is_abort());
        assert_eq!(err.to_string(), "0x80000106:timeout");
        let boxed: Box<dyn std::error::Error> =
            Box::new(DriverError::new(DriverError::NOT_SUPPORTED, "not supported"));
        assert_eq!(boxed.to_string(), "0x80000F03:not supported");
    }

    #[test]
    fn test_trigger_source_property_value() {
        for source in [TriggerSource::Internal, TriggerSource::Software] {
            assert_eq!(TriggerSource::from_property_value(
                source.as_property_value()), Some(source));
        }
        assert_eq!(TriggerSource::from_property_value(7.0), None);
    }
}
