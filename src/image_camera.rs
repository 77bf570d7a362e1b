// Fake camera that yields a fixed image into a simulated ring buffer. For
// testing, and for running the acquisition controller without hardware.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use image::{ImageBuffer, Luma};
use log::{debug, info, warn};

use crate::abstract_camera::{AbstractCamera, CameraApi, CaptureEvents,
                             CaptureMode, DeviceInfo, DriverError, FrameBuffer,
                             LockedFrame, PixelType, PropertyId, TransferInfo,
                             TriggerSource, WaitHandle};

/// Source image type: one 16-bit sample per pixel. Only the low
/// `bits_per_channel` bits are meaningful.
pub type Mono16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Horizontal ramp from 0 at the left edge to `max_value` at the right edge.
pub fn gradient_image(width: u32, height: u32, max_value: u16) -> Mono16Image {
    let denom = u32::max(1, width.saturating_sub(1));
    ImageBuffer::from_fn(width, height, |x, _y| {
        Luma([(x * max_value as u32 / denom) as u16])
    })
}

/// Camera operations a failure can be injected into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraOp {
    Open,
    Close,
    AllocateBuffer,
    ReleaseBuffer,
    StartCapture,
    StopCapture,
    FireTrigger,
    LockFrame,
    NewestFrameInfo,
    GetProperty,
    SetProperty,
    CreateWaitHandle,
}

// A frame as stored in one ring buffer slot.
#[derive(Clone)]
struct StoredFrame {
    data: Arc<Vec<u8>>,
    timestamp: SystemTime,
}

struct SimState {
    open: bool,
    bits_per_channel: i32,
    exposure: Duration,
    trigger_source: TriggerSource,

    // Ring buffer; None until allocate_buffer().
    format: FrameBuffer,
    slots: Option<Vec<Option<StoredFrame>>>,
    frame_data: Arc<Vec<u8>>,

    capture: Option<CaptureMode>,
    // Incremented whenever a capture starts or ends, so a producer thread can
    // tell that its capture is over.
    generation: u64,
    frames_captured: i32,
    newest_index: i32,

    // Event sequence numbers. Wait handles report an event when its sequence
    // number moves past the value they last saw.
    frame_seq: u64,
    stop_seq: u64,
    // Sequence numbers at the most recent capture start.
    capture_start_seqs: (u64, u64),

    injected: Vec<(CameraOp, DriverError)>,
}

impl SimState {
    fn take_injected(&mut self, op: CameraOp) -> Result<(), DriverError> {
        match self.injected.iter().position(|(o, _)| *o == op) {
            Some(pos) => Err(self.injected.remove(pos).1),
            None => Ok(()),
        }
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if !self.open {
            return Err(DriverError::new(DriverError::INVALID_HANDLE,
                                        "device is not open"));
        }
        Ok(())
    }

    fn pixel_type(&self) -> PixelType {
        if self.bits_per_channel <= 8 { PixelType::Mono8 } else { PixelType::Mono16 }
    }

    // Writes the next frame into the ring buffer. Must be called with capture
    // running.
    fn produce_frame(&mut self) {
        let Some(slots) = self.slots.as_mut() else {
            return;
        };
        let index = self.frames_captured % slots.len() as i32;
        slots[index as usize] = Some(StoredFrame{data: self.frame_data.clone(),
                                                 timestamp: SystemTime::now()});
        self.newest_index = index;
        self.frames_captured += 1;
        self.frame_seq += 1;
        if self.capture == Some(CaptureMode::Snap) &&
            self.frames_captured >= self.format.frame_count
        {
            self.end_capture();
        }
    }

    fn end_capture(&mut self) {
        self.capture = None;
        self.generation += 1;
        self.stop_seq += 1;
    }
}

struct Shared {
    state: Mutex<SimState>,
    // Signalled whenever a frame is produced, capture stops, the device is
    // closed, or a wait is aborted.
    events: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Bit depths the simulated sensor can deliver.
const MIN_BITS_PER_CHANNEL: i32 = 8;
const MAX_BITS_PER_CHANNEL: i32 = 16;

pub struct ImageCamera {
    index: i32,
    image: Arc<Mono16Image>,
    shared: Arc<Shared>,
}

impl ImageCamera {
    /// `bits_per_channel` is clamped to 8..=16.
    pub fn new(index: i32, image: Mono16Image, bits_per_channel: i32) -> Self {
        let bits = bits_per_channel.clamp(MIN_BITS_PER_CHANNEL, MAX_BITS_PER_CHANNEL);
        if bits != bits_per_channel {
            warn!("Camera {} cannot deliver {} bits per channel, using {}",
                  index, bits_per_channel, bits);
        }
        ImageCamera{
            index,
            image: Arc::new(image),
            shared: Arc::new(Shared{
                state: Mutex::new(SimState{
                    open: false,
                    bits_per_channel: bits,
                    exposure: Duration::from_millis(10),
                    trigger_source: TriggerSource::Internal,
                    format: FrameBuffer::default(),
                    slots: None,
                    frame_data: Arc::new(Vec::new()),
                    capture: None,
                    generation: 0,
                    frames_captured: 0,
                    newest_index: -1,
                    frame_seq: 0,
                    stop_seq: 0,
                    capture_start_seqs: (0, 0),
                    injected: Vec::new(),
                }),
                events: Condvar::new(),
            }),
        }
    }

    /// The next call of `op` fails with `code`.
    pub fn inject_failure(&self, op: CameraOp, code: u32) {
        let mut state = self.shared.lock();
        state.injected.push((op, DriverError::new(code, "injected failure")));
    }

    pub fn set_trigger_source(&self, trigger_source: TriggerSource) {
        self.shared.lock().trigger_source = trigger_source;
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.lock().capture.is_some()
    }

    pub fn is_buffer_allocated(&self) -> bool {
        self.shared.lock().slots.is_some()
    }

    fn open(&self) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::Open)?;
        if state.open {
            return Err(DriverError::new(DriverError::BUSY, "device already open"));
        }
        state.open = true;
        info!("ImageCamera {} opened", self.index);
        Ok(())
    }

    // Converts the source image to frame data in the current pixel type.
    fn render_frame_data(&self, bits_per_channel: i32) -> Vec<u8> {
        let max_value = ((1u32 << bits_per_channel) - 1) as u16;
        if bits_per_channel <= 8 {
            self.image.pixels().map(|p| u16::min(p.0[0], max_value) as u8).collect()
        } else {
            self.image.pixels()
                .flat_map(|p| u16::min(p.0[0], max_value).to_le_bytes())
                .collect()
        }
    }

    // Fires frames at the exposure interval until the capture identified by
    // `generation` ends.
    fn internal_trigger_worker(shared: Arc<Shared>, generation: u64) {
        let mut state = shared.lock();
        loop {
            if state.generation != generation {
                break;
            }
            let deadline = Instant::now() + state.exposure;
            loop {
                let now = Instant::now();
                if now >= deadline || state.generation != generation {
                    break;
                }
                state = shared.events.wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner).0;
            }
            if state.generation != generation {
                break;
            }
            state.produce_frame();
            shared.events.notify_all();
        }
        debug!("Internal trigger worker for capture {} exiting", generation);
    }
}

impl AbstractCamera for ImageCamera {
    fn model_info(&self) -> Result<DeviceInfo, DriverError> {
        let state = self.shared.lock();
        state.check_open()?;
        Ok(DeviceInfo{
            vendor: "Simulated".to_string(),
            model: "ImageCamera".to_string(),
            serial_number: format!("S/N: {:06}", self.index),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            bits_per_channel: state.bits_per_channel,
        })
    }

    fn close(&self) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::Close)?;
        state.check_open()?;
        if state.capture.is_some() {
            state.end_capture();
        }
        state.slots = None;
        state.format.clear();
        state.open = false;
        self.shared.events.notify_all();
        info!("ImageCamera {} closed", self.index);
        Ok(())
    }

    fn allocate_buffer(&self, frame_count: i32) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::AllocateBuffer)?;
        state.check_open()?;
        if frame_count < 1 {
            return Err(DriverError::new(DriverError::INVALID_PARAM,
                                        "frame count must be positive"));
        }
        if state.slots.is_some() {
            return Err(DriverError::new(DriverError::BUSY, "buffer already allocated"));
        }
        let (width, height) = self.image.dimensions();
        state.format = FrameBuffer{frame_count,
                                   width: width as i32,
                                   height: height as i32,
                                   pixel_type: state.pixel_type()};
        state.frame_data = Arc::new(self.render_frame_data(state.bits_per_channel));
        state.slots = Some(vec![None; frame_count as usize]);
        state.frames_captured = 0;
        state.newest_index = -1;
        Ok(())
    }

    fn release_buffer(&self) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::ReleaseBuffer)?;
        state.check_open()?;
        if state.capture.is_some() {
            return Err(DriverError::new(DriverError::BUSY, "capture in progress"));
        }
        state.slots = None;
        state.format.clear();
        Ok(())
    }

    fn lock_frame(&self, index: i32) -> Result<LockedFrame, DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::LockFrame)?;
        state.check_open()?;
        let index = if index == -1 { state.newest_index } else { index };
        let stored = state.slots.as_ref()
            .ok_or_else(|| DriverError::new(DriverError::NOT_READY, "no buffer"))?
            .get(index.max(0) as usize)
            .filter(|_| index >= 0)
            .cloned()
            .flatten()
            .ok_or_else(|| DriverError::new(DriverError::INVALID_FRAME_INDEX,
                                            &format!("no frame at index {}", index)))?;
        let format = state.format;
        Ok(LockedFrame{
            index,
            width: format.width,
            height: format.height,
            pixel_type: format.pixel_type,
            row_bytes: format.width as usize * format.pixel_type.bytes_per_pixel(),
            data: stored.data,
            timestamp: stored.timestamp,
        })
    }

    fn start_capture(&self, mode: CaptureMode) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::StartCapture)?;
        state.check_open()?;
        if state.slots.is_none() {
            return Err(DriverError::new(DriverError::NOT_READY, "no buffer"));
        }
        if state.capture.is_some() {
            return Err(DriverError::new(DriverError::BUSY, "capture in progress"));
        }
        state.capture = Some(mode);
        state.generation += 1;
        state.frames_captured = 0;
        state.newest_index = -1;
        state.capture_start_seqs = (state.frame_seq, state.stop_seq);
        if state.trigger_source == TriggerSource::Internal {
            let shared = self.shared.clone();
            let generation = state.generation;
            thread::spawn(move || Self::internal_trigger_worker(shared, generation));
        }
        debug!("ImageCamera {} started {} capture", self.index, mode);
        Ok(())
    }

    fn stop_capture(&self) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::StopCapture)?;
        state.check_open()?;
        // A Snap capture may already have stopped by itself.
        if state.capture.is_some() {
            state.end_capture();
            self.shared.events.notify_all();
        }
        Ok(())
    }

    fn fire_trigger(&self) -> Result<(), DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::FireTrigger)?;
        state.check_open()?;
        if state.capture.is_none() {
            return Err(DriverError::new(DriverError::NOT_BUSY, "not capturing"));
        }
        if state.trigger_source != TriggerSource::Software {
            return Err(DriverError::new(DriverError::NOT_READY,
                                        "trigger source is not software"));
        }
        state.produce_frame();
        self.shared.events.notify_all();
        Ok(())
    }

    fn newest_frame_info(&self) -> Result<TransferInfo, DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::NewestFrameInfo)?;
        state.check_open()?;
        if state.slots.is_none() {
            return Err(DriverError::new(DriverError::NOT_READY, "no buffer"));
        }
        Ok(TransferInfo{newest_frame_index: state.newest_index,
                        frame_count: state.frames_captured})
    }

    fn get_property(&self, id: PropertyId) -> Result<f64, DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::GetProperty)?;
        state.check_open()?;
        let (width, height) = self.image.dimensions();
        Ok(match id {
            PropertyId::BitsPerChannel => state.bits_per_channel as f64,
            PropertyId::ExposureTime => state.exposure.as_secs_f64(),
            PropertyId::TriggerSource => state.trigger_source.as_property_value(),
            PropertyId::ImageWidth => width as f64,
            PropertyId::ImageHeight => height as f64,
        })
    }

    fn set_property(&self, id: PropertyId, value: f64) -> Result<f64, DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::SetProperty)?;
        state.check_open()?;
        match id {
            PropertyId::BitsPerChannel => {
                if state.slots.is_some() {
                    return Err(DriverError::new(DriverError::BUSY,
                                                "buffer is allocated"));
                }
                let bits = value.round() as i32;
                if !(MIN_BITS_PER_CHANNEL..=MAX_BITS_PER_CHANNEL).contains(&bits) {
                    return Err(DriverError::new(DriverError::INVALID_VALUE,
                                                "bits per channel out of range"));
                }
                state.bits_per_channel = bits;
                Ok(bits as f64)
            },
            PropertyId::ExposureTime => {
                if !value.is_finite() {
                    return Err(DriverError::new(DriverError::INVALID_VALUE,
                                                "exposure time is not finite"));
                }
                state.exposure = Duration::from_secs_f64(value.clamp(0.0001, 10.0));
                Ok(state.exposure.as_secs_f64())
            },
            PropertyId::TriggerSource => {
                let source = TriggerSource::from_property_value(value).ok_or_else(
                    || DriverError::new(DriverError::INVALID_VALUE,
                                        "unknown trigger source"))?;
                state.trigger_source = source;
                Ok(source.as_property_value())
            },
            PropertyId::ImageWidth | PropertyId::ImageHeight => {
                Err(DriverError::new(DriverError::NOT_SUPPORTED,
                                     "property is read only"))
            },
        }
    }

    fn create_wait_handle(&self) -> Result<Box<dyn WaitHandle>, DriverError> {
        let mut state = self.shared.lock();
        state.take_injected(CameraOp::CreateWaitHandle)?;
        state.check_open()?;
        // Events of a capture in progress are still pending for a new handle.
        let seen = if state.slots.is_some() {
            state.capture_start_seqs
        } else {
            (state.frame_seq, state.stop_seq)
        };
        Ok(Box::new(ImageCameraWait{
            shared: self.shared.clone(),
            seen: Mutex::new(seen),
            abort_requests: AtomicU64::new(0),
            aborts_seen: AtomicU64::new(0),
        }))
    }
}

struct ImageCameraWait {
    shared: Arc<Shared>,
    // (frame_seq, stop_seq) last reported.
    seen: Mutex<(u64, u64)>,
    abort_requests: AtomicU64,
    aborts_seen: AtomicU64,
}

impl WaitHandle for ImageCameraWait {
    fn wait(&self, mask: CaptureEvents, timeout: Duration)
            -> Result<CaptureEvents, DriverError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let requests = self.abort_requests.load(Ordering::SeqCst);
            if requests != self.aborts_seen.swap(requests, Ordering::SeqCst) {
                return Err(DriverError::abort());
            }
            state.check_open()?;

            let mut occurred = CaptureEvents::NONE;
            if mask.contains(CaptureEvents::FRAME_READY) && state.frame_seq > seen.0 {
                occurred |= CaptureEvents::FRAME_READY;
                seen.0 = state.frame_seq;
            }
            if mask.contains(CaptureEvents::STOPPED) && state.stop_seq > seen.1 {
                occurred |= CaptureEvents::STOPPED;
                seen.1 = state.stop_seq;
            }
            if !occurred.is_empty() {
                return Ok(occurred);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::timeout());
            }
            state = self.shared.events.wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner).0;
        }
    }

    fn abort(&self) {
        self.abort_requests.fetch_add(1, Ordering::SeqCst);
        // Taking the lock orders us with a waiter that has checked for
        // aborts but not yet blocked.
        let _state = self.shared.lock();
        self.shared.events.notify_all();
    }
}

/// Driver module serving a fixed set of ImageCamera devices.
pub struct ImageCameraApi {
    devices: Vec<Arc<ImageCamera>>,
    initialized: AtomicBool,
}

impl ImageCameraApi {
    /// One device per image, each delivering `bits_per_channel` bits.
    pub fn new(images: Vec<Mono16Image>, bits_per_channel: i32) -> Self {
        let devices = images.into_iter().enumerate()
            .map(|(i, image)| Arc::new(ImageCamera::new(i as i32, image, bits_per_channel)))
            .collect();
        ImageCameraApi{devices, initialized: AtomicBool::new(false)}
    }

    /// Direct access to a device, e.g. to inject failures or fire triggers.
    pub fn device(&self, index: i32) -> Option<Arc<ImageCamera>> {
        usize::try_from(index).ok().and_then(|i| self.devices.get(i)).cloned()
    }
}

impl CameraApi for ImageCameraApi {
    fn init(&self) -> Result<i32, DriverError> {
        if self.devices.is_empty() {
            return Err(DriverError::new(DriverError::NO_CAMERA, "no device found"));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(self.devices.len() as i32)
    }

    fn uninit(&self) -> Result<(), DriverError> {
        if self.devices.iter().any(|d| d.is_open()) {
            return Err(DriverError::new(DriverError::BUSY, "a device is still open"));
        }
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn open(&self, index: i32) -> Result<Arc<dyn AbstractCamera>, DriverError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(DriverError::new(DriverError::NOT_READY, "not initialized"));
        }
        let device = self.device(index).ok_or_else(
            || DriverError::new(DriverError::NO_CAMERA,
                                &format!("no device at index {}", index)))?;
        device.open()?;
        let camera: Arc<dyn AbstractCamera> = device;
        Ok(camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(bits_per_channel: i32) -> ImageCameraApi {
        let image = gradient_image(16, 4, ((1u32 << bits_per_channel) - 1) as u16);
        let api = ImageCameraApi::new(vec![image], bits_per_channel);
        api.init().unwrap();
        api
    }

    #[test]
    fn test_gradient_image() {
        let image = gradient_image(5, 2, 4000);
        assert_eq!(image.get_pixel(0, 1).0[0], 0);
        assert_eq!(image.get_pixel(2, 0).0[0], 2000);
        assert_eq!(image.get_pixel(4, 1).0[0], 4000);
    }

    #[test]
    fn test_open_requires_init_and_is_exclusive() {
        let image = gradient_image(4, 4, 255);
        let api = ImageCameraApi::new(vec![image], 8);
        assert_eq!(api.open(0).err().unwrap().code(), DriverError::NOT_READY);
        api.init().unwrap();
        assert_eq!(api.open(3).err().unwrap().code(), DriverError::NO_CAMERA);
        let camera = api.open(0).unwrap();
        assert_eq!(api.open(0).err().unwrap().code(), DriverError::BUSY);
        assert_eq!(api.uninit().unwrap_err().code(), DriverError::BUSY);
        camera.close().unwrap();
        api.uninit().unwrap();
    }

    #[test]
    fn test_software_triggered_snap_auto_stops() {
        let api = api(12);
        let device = api.device(0).unwrap();
        device.set_trigger_source(TriggerSource::Software);
        let camera = api.open(0).unwrap();
        camera.allocate_buffer(2).unwrap();
        camera.start_capture(CaptureMode::Snap).unwrap();
        camera.fire_trigger().unwrap();
        assert_eq!(camera.newest_frame_info().unwrap(),
                   TransferInfo{newest_frame_index: 0, frame_count: 1});
        camera.fire_trigger().unwrap();
        assert_eq!(camera.newest_frame_info().unwrap(),
                   TransferInfo{newest_frame_index: 1, frame_count: 2});
        assert!(!device.is_capturing());
        assert_eq!(camera.fire_trigger().unwrap_err().code(), DriverError::NOT_BUSY);
        // Stopping an auto-stopped capture succeeds.
        camera.stop_capture().unwrap();
    }

    #[test]
    fn test_lock_frame() {
        let api = api(12);
        api.device(0).unwrap().set_trigger_source(TriggerSource::Software);
        let camera = api.open(0).unwrap();
        assert_eq!(camera.lock_frame(0).unwrap_err().code(), DriverError::NOT_READY);
        camera.allocate_buffer(3).unwrap();
        assert_eq!(camera.lock_frame(-1).unwrap_err().code(),
                   DriverError::INVALID_FRAME_INDEX);
        camera.start_capture(CaptureMode::Sequence).unwrap();
        camera.fire_trigger().unwrap();
        let frame = camera.lock_frame(-1).unwrap();
        assert_eq!(frame.index, 0);
        assert_eq!((frame.width, frame.height), (16, 4));
        assert_eq!(frame.pixel_type, PixelType::Mono16);
        assert_eq!(frame.row_bytes, 32);
        assert_eq!(frame.data.len(), 16 * 4 * 2);
        assert_eq!(u16::from_le_bytes([frame.data[30], frame.data[31]]), 4095);
        assert_eq!(camera.lock_frame(2).unwrap_err().code(),
                   DriverError::INVALID_FRAME_INDEX);
        assert_eq!(camera.lock_frame(7).unwrap_err().code(),
                   DriverError::INVALID_FRAME_INDEX);
    }

    #[test]
    fn test_sequence_wraps_ring_buffer() {
        let api = api(8);
        api.device(0).unwrap().set_trigger_source(TriggerSource::Software);
        let camera = api.open(0).unwrap();
        camera.allocate_buffer(3).unwrap();
        camera.start_capture(CaptureMode::Sequence).unwrap();
        for _ in 0..5 {
            camera.fire_trigger().unwrap();
        }
        assert_eq!(camera.newest_frame_info().unwrap(),
                   TransferInfo{newest_frame_index: 1, frame_count: 5});
        let frame = camera.lock_frame(1).unwrap();
        assert_eq!(frame.pixel_type, PixelType::Mono8);
        assert_eq!(frame.data.len(), 16 * 4);
        camera.stop_capture().unwrap();
        camera.release_buffer().unwrap();
    }

    #[test]
    fn test_internal_trigger_produces_frames() {
        let api = api(12);
        let camera = api.open(0).unwrap();
        camera.set_property(PropertyId::ExposureTime, 0.002).unwrap();
        camera.allocate_buffer(4).unwrap();
        let wait = camera.create_wait_handle().unwrap();
        camera.start_capture(CaptureMode::Snap).unwrap();
        let mut stopped = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !stopped && Instant::now() < deadline {
            let events = wait.wait(CaptureEvents::FRAME_READY | CaptureEvents::STOPPED,
                                   Duration::from_millis(200)).unwrap();
            stopped = events.contains(CaptureEvents::STOPPED);
        }
        assert!(stopped);
        assert_eq!(camera.newest_frame_info().unwrap().frame_count, 4);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let api = api(12);
        let device = api.device(0).unwrap();
        let camera = api.open(0).unwrap();
        camera.allocate_buffer(3).unwrap();
        device.inject_failure(CameraOp::StartCapture, DriverError::NO_MEMORY);
        assert_eq!(camera.start_capture(CaptureMode::Sequence).unwrap_err().code(),
                   DriverError::NO_MEMORY);
        camera.start_capture(CaptureMode::Sequence).unwrap();
        camera.stop_capture().unwrap();
    }

    #[test]
    fn test_properties() {
        let api = api(12);
        let camera = api.open(0).unwrap();
        assert_eq!(camera.get_property(PropertyId::BitsPerChannel).unwrap(), 12.0);
        assert_eq!(camera.get_property(PropertyId::ImageWidth).unwrap(), 16.0);
        assert_eq!(camera.set_property(PropertyId::BitsPerChannel, 16.0).unwrap(), 16.0);
        assert_eq!(camera.set_property(PropertyId::BitsPerChannel, 20.0)
                   .unwrap_err().code(), DriverError::INVALID_VALUE);
        assert_eq!(camera.set_property(PropertyId::ImageHeight, 10.0)
                   .unwrap_err().code(), DriverError::NOT_SUPPORTED);
        assert_eq!(camera.set_property(PropertyId::TriggerSource, 2.0).unwrap(), 2.0);
        let info = camera.model_info().unwrap();
        assert_eq!(info.model, "ImageCamera");
        assert_eq!(info.bits_per_channel, 16);
    }

    #[test]
    fn test_bit_depth_is_clamped() {
        let image = gradient_image(4, 4, 255);
        let api = ImageCameraApi::new(vec![image.clone(), image], 32);
        api.init().unwrap();
        let camera = api.open(0).unwrap();
        assert_eq!(camera.get_property(PropertyId::BitsPerChannel).unwrap(), 16.0);
        camera.close().unwrap();

        let api = ImageCameraApi::new(vec![gradient_image(4, 4, 255)], 4);
        api.init().unwrap();
        let camera = api.open(0).unwrap();
        assert_eq!(camera.get_property(PropertyId::BitsPerChannel).unwrap(), 8.0);
    }

    #[test]
    fn test_close_ends_session() {
        let api = api(12);
        let camera = api.open(0).unwrap();
        camera.allocate_buffer(3).unwrap();
        camera.close().unwrap();
        assert_eq!(camera.allocate_buffer(3).unwrap_err().code(),
                   DriverError::INVALID_HANDLE);
        assert!(!api.device(0).unwrap().is_buffer_allocated());
        // Reopen.
        api.open(0).unwrap();
    }
}
