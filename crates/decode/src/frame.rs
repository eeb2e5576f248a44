//! Decoded frame ownership.
//!
//! A [`DecodedFrame`] has exactly one owner. It cannot be cloned, and it is
//! released exactly once: by [`DecodedFrame::release`] or when dropped.
//! Every frame reports to a shared [`FrameAccounting`] so leaks show up as a
//! non-zero `outstanding` count.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use grabme_common::error::{PipelineError, PipelineResult};

/// Tightly packed 8-bit RGBA pixels, validated once at construction.
#[derive(Clone, PartialEq, Eq)]
pub struct RgbaImage {
    width: u32,
    height: u32,
    data: Bytes,
}

impl RgbaImage {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> PipelineResult<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(PipelineError::decode(format!(
                "RGBA image {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// An image filled with one colour.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> PipelineResult<Self> {
        let pixels = width as usize * height as usize;
        let data: Vec<u8> = rgba.iter().copied().cycle().take(pixels * 4).collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the pixel bytes.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Pixel at `(x, y)`. Coordinates are clamped to the image.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let x = x.min(self.width - 1) as usize;
        let y = y.min(self.height - 1) as usize;
        let i = (y * self.width as usize + x) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }
}

impl fmt::Debug for RgbaImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RgbaImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Counters {
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Shared allocated/released counters for a family of frames.
#[derive(Debug, Clone, Default)]
pub struct FrameAccounting {
    counters: Arc<Counters>,
}

/// Point-in-time copy of [`FrameAccounting`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccountingSnapshot {
    pub allocated: u64,
    pub released: u64,
    pub outstanding: u64,
}

impl FrameAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated(&self) -> u64 {
        self.counters.allocated.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::Acquire)
    }

    /// Frames currently alive.
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }

    pub fn snapshot(&self) -> AccountingSnapshot {
        let allocated = self.allocated();
        let released = self.released();
        AccountingSnapshot {
            allocated,
            released,
            outstanding: allocated.saturating_sub(released),
        }
    }

    /// Wrap `image` in a new tracked frame.
    pub fn frame(&self, timestamp_us: i64, duration_us: i64, image: RgbaImage) -> DecodedFrame {
        self.counters.allocated.fetch_add(1, Ordering::AcqRel);
        DecodedFrame {
            timestamp_us,
            duration_us,
            image,
            accounting: Some(self.clone()),
        }
    }
}

/// Move-only handle over a decoded image.
pub struct DecodedFrame {
    timestamp_us: i64,
    duration_us: i64,
    image: RgbaImage,
    accounting: Option<FrameAccounting>,
}

impl DecodedFrame {
    /// Presentation timestamp (µs).
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_us as f64 / 1_000.0
    }

    pub fn duration_us(&self) -> i64 {
        self.duration_us
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    /// A new, separately owned frame showing the same pixels at another
    /// timestamp. Used to hold the last frame across gaps.
    pub fn duplicate_at(&self, timestamp_us: i64) -> DecodedFrame {
        match &self.accounting {
            Some(accounting) => accounting.frame(timestamp_us, self.duration_us, self.image.clone()),
            None => DecodedFrame {
                timestamp_us,
                duration_us: self.duration_us,
                image: self.image.clone(),
                accounting: None,
            },
        }
    }

    /// Release the frame now. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Release the frame and keep its pixels.
    pub fn into_image(self) -> RgbaImage {
        self.image.clone()
    }
}

impl Drop for DecodedFrame {
    fn drop(&mut self) {
        if let Some(accounting) = self.accounting.take() {
            accounting.counters.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("timestamp_us", &self.timestamp_us)
            .field("duration_us", &self.duration_us)
            .field("width", &self.image.width)
            .field("height", &self.image.height)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> RgbaImage {
        RgbaImage::filled(2, 2, [1, 2, 3, 4]).unwrap()
    }

    #[test]
    fn test_image_validates_length() {
        assert!(RgbaImage::new(2, 2, vec![0u8; 15]).is_err());
        assert!(RgbaImage::new(0, 2, Vec::new()).is_err());
        let img = image();
        assert_eq!(img.pixel(1, 1), [1, 2, 3, 4]);
        assert_eq!(img.pixel(9, 9), [1, 2, 3, 4]);
    }

    #[test]
    fn test_release_and_drop_count_once() {
        let accounting = FrameAccounting::new();
        let a = accounting.frame(0, 33_333, image());
        let b = accounting.frame(33_333, 33_333, image());
        assert_eq!(accounting.outstanding(), 2);

        a.release();
        assert_eq!(accounting.released(), 1);
        drop(b);
        assert_eq!(accounting.snapshot().outstanding, 0);
        assert_eq!(accounting.allocated(), 2);
    }

    #[test]
    fn test_duplicate_is_tracked_separately() {
        let accounting = FrameAccounting::new();
        let frame = accounting.frame(0, 1_000, image());
        let held = frame.duplicate_at(5_000);
        assert_eq!(held.timestamp_us(), 5_000);
        frame.release();
        assert_eq!(accounting.outstanding(), 1);
        let pixels = held.into_image();
        assert_eq!(pixels.width(), 2);
        assert_eq!(accounting.outstanding(), 0);
    }
}
