//! Clock and time-base utilities for the export pipeline.
//!
//! Container timestamps are carried in microseconds, the editing layer
//! speaks milliseconds, and frame indices are derived from a constant
//! frame-duration stride. This module keeps those conversions in one place:
//! - The export clock (wall-clock start plus monotonic elapsed time)
//! - Frame-rate time bases (index <-> timestamp)
//! - Rate limiting for progress reporting

use std::time::{Duration, Instant};

/// Monotonic clock anchored at the start of an export job.
#[derive(Debug, Clone)]
pub struct ExportClock {
    /// The instant the job started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl ExportClock {
    /// Create a clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Time elapsed since the job started.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Seconds elapsed since the job started.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at job start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Estimate remaining seconds given completed vs total units of work.
    pub fn eta_secs(&self, done: u64, total: u64) -> f64 {
        if done == 0 || total <= done {
            return 0.0;
        }
        let per_unit = self.elapsed_secs() / done as f64;
        per_unit * (total - done) as f64
    }
}

/// Convert microseconds to milliseconds.
pub fn us_to_ms(us: i64) -> f64 {
    us as f64 / 1_000.0
}

/// Convert milliseconds to microseconds, rounding to the nearest tick.
pub fn ms_to_us(ms: f64) -> i64 {
    (ms * 1_000.0).round() as i64
}

/// Constant-frame-rate time base.
///
/// Maps frame indices to presentation timestamps through a fixed
/// frame-duration stride.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTimebase {
    fps: f64,
    frame_duration_us: i64,
}

impl FrameTimebase {
    /// Create a time base for `fps` frames per second.
    ///
    /// Non-finite or non-positive rates fall back to 30 fps.
    pub fn new(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        Self {
            fps,
            frame_duration_us: (1_000_000.0 / fps).round().max(1.0) as i64,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Duration of one frame in microseconds.
    pub fn frame_duration_us(&self) -> i64 {
        self.frame_duration_us
    }

    /// Duration of one frame in milliseconds.
    pub fn frame_duration_ms(&self) -> f64 {
        us_to_ms(self.frame_duration_us)
    }

    /// Presentation timestamp of frame `index`.
    pub fn index_to_us(&self, index: u64) -> i64 {
        (index as f64 * 1_000_000.0 / self.fps).round() as i64
    }

    /// Presentation time of frame `index` in milliseconds.
    pub fn index_to_ms(&self, index: u64) -> f64 {
        index as f64 * 1_000.0 / self.fps
    }

    /// Nearest frame index for a timestamp; negative timestamps map to 0.
    pub fn us_to_index(&self, us: i64) -> u64 {
        if us <= 0 {
            return 0;
        }
        (us as f64 * self.fps / 1_000_000.0).round() as u64
    }

    /// Nearest frame index for a millisecond time.
    pub fn ms_to_index(&self, ms: f64) -> u64 {
        self.us_to_index(ms_to_us(ms))
    }

    /// Number of frames needed to cover `duration_ms`.
    pub fn frames_in(&self, duration_ms: f64) -> u64 {
        if duration_ms <= 0.0 {
            return 0;
        }
        // Tolerate float noise right at a frame boundary.
        (duration_ms * self.fps / 1_000.0 - 1e-6).ceil().max(0.0) as u64
    }
}

/// Rate limiter for progress callbacks.
#[derive(Debug)]
pub struct RateController {
    interval: Duration,
    last_tick: Option<Instant>,
}

impl RateController {
    /// Create a controller targeting the given Hz rate.
    pub fn new(target_hz: u32) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / target_hz.max(1) as f64),
            last_tick: None,
        }
    }

    /// Check whether enough time has passed since the previous tick.
    /// The first call always returns true.
    pub fn should_tick(&mut self, now: Instant) -> bool {
        match self.last_tick {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_tick = Some(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_elapsed() {
        let clock = ExportClock::start();
        assert!(clock.elapsed() < Duration::from_secs(1));
        assert!(!clock.epoch_wall().is_empty());
    }

    #[test]
    fn test_ms_us_conversion() {
        assert_eq!(ms_to_us(1.5), 1_500);
        assert!((us_to_ms(2_500) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_timebase_round_trip() {
        let tb = FrameTimebase::new(30.0);
        assert_eq!(tb.frame_duration_us(), 33_333);
        for index in [0u64, 1, 29, 30, 31, 1_799] {
            assert_eq!(tb.us_to_index(tb.index_to_us(index)), index);
        }
        assert_eq!(tb.frames_in(1_000.0), 30);
        assert_eq!(tb.frames_in(1_010.0), 31);
        assert_eq!(tb.frames_in(0.0), 0);
    }

    #[test]
    fn test_timebase_rejects_bad_fps() {
        assert_eq!(FrameTimebase::new(0.0).fps(), 30.0);
        assert_eq!(FrameTimebase::new(f64::NAN).fps(), 30.0);
    }

    #[test]
    fn test_rate_controller() {
        let mut ctrl = RateController::new(10);
        let start = Instant::now();
        assert!(ctrl.should_tick(start)); // first tick always fires
        assert!(!ctrl.should_tick(start + Duration::from_millis(20)));
        assert!(ctrl.should_tick(start + Duration::from_millis(120)));
    }
}
