use std::time::{Duration, Instant};

/// Frame timing as observed by the capture loop over one acquisition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameRateStats {
    /// Frame count most recently reported by the device since capture start.
    pub total_frames: i32,
    /// Frames that reached the display.
    pub displayed_frames: i32,
    /// Frames captured by the device but superseded before we got to them.
    pub skipped_frames: i32,

    pub latest_period: Option<Duration>,
    pub fastest_period: Option<Duration>,
    pub slowest_period: Option<Duration>,

    // Time of the first frame-ready we observed, and of the most recent.
    first_frame_time: Option<Instant>,
    last_frame_time: Option<Instant>,
    // Device frame count at first_frame_time.
    first_frame_count: i32,
}

impl FrameRateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records a frame-ready event. `frame_count` is the device's running count
    /// of frames captured since capture start. Frames the device captured
    /// beyond the one we are about to process are counted as skipped.
    pub fn record_frame_ready(&mut self, frame_count: i32, now: Instant) {
        let advanced = frame_count - self.total_frames;
        if advanced <= 0 {
            // Stale or repeated notification.
            return;
        }
        self.skipped_frames += advanced - 1;
        if let Some(last) = self.last_frame_time {
            let period = now.saturating_duration_since(last) / advanced as u32;
            self.latest_period = Some(period);
            self.fastest_period = Some(self.fastest_period.map_or(period, |p| p.min(period)));
            self.slowest_period = Some(self.slowest_period.map_or(period, |p| p.max(period)));
        } else {
            self.first_frame_time = Some(now);
            self.first_frame_count = frame_count;
        }
        self.last_frame_time = Some(now);
        self.total_frames = frame_count;
    }

    pub fn record_displayed(&mut self) {
        self.displayed_frames += 1;
    }

    /// Mean inter-frame period since the first observed frame.
    pub fn average_period(&self) -> Option<Duration> {
        let (first, last) = (self.first_frame_time?, self.last_frame_time?);
        let intervals = self.total_frames - self.first_frame_count;
        if intervals <= 0 {
            return None;
        }
        Some(last.saturating_duration_since(first) / intervals as u32)
    }

    pub fn latest_rate(&self) -> Option<f64> { to_rate(self.latest_period) }
    pub fn fastest_rate(&self) -> Option<f64> { to_rate(self.fastest_period) }
    pub fn slowest_rate(&self) -> Option<f64> { to_rate(self.slowest_period) }
    pub fn average_rate(&self) -> Option<f64> { to_rate(self.average_period()) }
}

// Frames per second for a period; None for a zero or missing period.
fn to_rate(period: Option<Duration>) -> Option<f64> {
    period.filter(|p| !p.is_zero()).map(|p| 1.0 / p.as_secs_f64())
}
