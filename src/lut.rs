// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Windowing of raw camera samples into 8-bit display intensities.

use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use image::GrayImage;
use thiserror::Error;

use crate::abstract_camera::{LockedFrame, PixelType};

/// Input window applied when converting raw samples for display. Samples at or
/// below `min` display as black, samples at or above `max` display as white.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LutWindow {
    camera_max: u32,
    min: u32,
    max: u32,
}

impl Default for LutWindow {
    fn default() -> Self {
        LutWindow::new(8)
    }
}

impl LutWindow {
    /// Full-range window for a camera delivering `bits_per_pixel` bits.
    pub fn new(bits_per_pixel: u32) -> LutWindow {
        let bits_per_pixel = bits_per_pixel.clamp(1, 16);
        let camera_max = (1 << bits_per_pixel) - 1;
        LutWindow{camera_max, min: 0, max: camera_max}
    }

    pub fn camera_max(&self) -> u32 { self.camera_max }
    pub fn min(&self) -> u32 { self.min }
    pub fn max(&self) -> u32 { self.max }

    /// Changes the camera bit depth, clamping the window into the new range.
    /// Returns true if either window bound had to be clamped.
    pub fn set_bits_per_pixel(&mut self, bits_per_pixel: u32) -> bool {
        let bits_per_pixel = bits_per_pixel.clamp(1, 16);
        self.camera_max = (1 << bits_per_pixel) - 1;
        let clamped = self.min > self.camera_max || self.max > self.camera_max;
        self.min = self.min.min(self.camera_max);
        self.max = self.max.min(self.camera_max);
        clamped
    }

    /// Returns true if `min` was above camera_max and was clamped.
    pub fn set_min(&mut self, min: u32) -> bool {
        self.min = min.min(self.camera_max);
        min > self.camera_max
    }

    /// Returns true if `max` was above camera_max and was clamped.
    pub fn set_max(&mut self, max: u32) -> bool {
        self.max = max.min(self.camera_max);
        max > self.camera_max
    }

    /// Checks that the window can be applied.
    pub fn validate(&self) -> Result<(), RescaleError> {
        if self.min > self.max {
            return Err(RescaleError::InvertedWindow{min: self.min, max: self.max});
        }
        Ok(())
    }
}

/// Failure of the windowing stage. These are configuration or data problems,
/// reported separately from driver errors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RescaleError {
    #[error("LUT window min {min} exceeds max {max}")]
    InvertedWindow { min: u32, max: u32 },
    /// Frame data holds fewer bytes than its dimensions call for.
    #[error("frame data has {actual} bytes, {expected} required")]
    TruncatedFrame { expected: usize, actual: usize },
}

impl RescaleError {
    pub fn code(&self) -> u32 {
        match self {
            RescaleError::InvertedWindow{..} => 0x8100_0001,
            RescaleError::TruncatedFrame{..} => 0x8100_0002,
        }
    }
}

impl From<RescaleError> for CanonicalError {
    fn from(err: RescaleError) -> Self {
        match err {
            RescaleError::InvertedWindow{..} =>
                invalid_argument_error(&err.to_string()),
            RescaleError::TruncatedFrame{..} =>
                failed_precondition_error(&err.to_string()),
        }
    }
}

/// Maps a single raw sample through the window [min, max]. When min == max
/// the window acts as a threshold at max.
fn map_sample(v: u32, min: u32, max: u32) -> u8 {
    if v >= max {
        255
    } else if v <= min {
        0
    } else {
        ((v - min) * 255 / (max - min)) as u8
    }
}

/// Lookup table covering every sample value up to the window's camera_max.
struct LutTable {
    table: Vec<u8>,
}

impl LutTable {
    fn new(window: &LutWindow) -> LutTable {
        let table = (0..=window.camera_max())
            .map(|v| map_sample(v, window.min(), window.max()))
            .collect();
        LutTable{table}
    }

    // Samples beyond camera_max (not expected from a well behaved camera)
    // saturate.
    fn lookup(&self, v: u16) -> u8 {
        *self.table.get(v as usize).unwrap_or(&255)
    }
}

/// Converts `frame` to an 8-bit display image through `window`.
/// Returns Ok(None) if the frame has no displayable content.
/// Callers sharing a window with other threads should pass a copy taken once
/// per call, so that min, max and bit depth are mutually consistent.
pub fn rescale(frame: &LockedFrame, window: &LutWindow)
               -> Result<Option<GrayImage>, RescaleError> {
    if !frame.is_valid() {
        return Ok(None);
    }
    window.validate()?;

    let width = frame.width as usize;
    let height = frame.height as usize;
    let bpp = frame.pixel_type.bytes_per_pixel();
    let row_bytes = frame.row_bytes.max(width * bpp);
    let expected = row_bytes * (height - 1) + width * bpp;
    if frame.data.len() < expected {
        return Err(RescaleError::TruncatedFrame{expected,
                                                actual: frame.data.len()});
    }

    let lut = LutTable::new(window);
    let mut pixels = Vec::with_capacity(width * height);
    for row in frame.data.chunks(row_bytes).take(height) {
        let row = &row[..width * bpp];
        match frame.pixel_type {
            PixelType::Mono8 => {
                pixels.extend(row.iter().map(|v| lut.lookup(*v as u16)));
            },
            PixelType::Mono16 => {
                pixels.extend(row.chunks_exact(2).map(
                    |b| lut.lookup(u16::from_le_bytes([b[0], b[1]]))));
            },
            PixelType::None => return Ok(None),
        }
    }
    Ok(GrayImage::from_raw(width as u32, height as u32, pixels))
}
