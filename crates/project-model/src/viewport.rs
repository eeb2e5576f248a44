//! Normalized crop rectangles and their pixel equivalents.
//!
//! A [`Viewport`] is the part of the source frame the compositor shows,
//! in `[0.0, 1.0]` units so it is independent of the recording size.

use serde::{Deserialize, Serialize};

const MIN_EXTENT: f64 = 0.01;

/// Visible region of the source frame. `(0, 0)` is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Left edge (normalized).
    pub x: f64,
    /// Top edge (normalized).
    pub y: f64,
    /// Width (normalized).
    pub w: f64,
    /// Height (normalized).
    pub h: f64,
}

/// Integer pixel rectangle inside a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// The whole frame.
    pub const FULL: Viewport = Viewport {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };

    /// Build a viewport, shifting and shrinking it to fit inside the frame.
    /// Width and height are at least 1% of the frame.
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        let w = w.clamp(MIN_EXTENT, 1.0);
        let h = h.clamp(MIN_EXTENT, 1.0);
        Self {
            x: x.clamp(0.0, 1.0 - w),
            y: y.clamp(0.0, 1.0 - h),
            w,
            h,
        }
    }

    pub fn right(&self) -> f64 {
        (self.x + self.w).min(1.0)
    }

    pub fn bottom(&self) -> f64 {
        (self.y + self.h).min(1.0)
    }

    /// Edges are inclusive.
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.right() && py >= self.y && py <= self.bottom()
    }

    /// Component-wise blend, `t` clamped to `[0, 1]`.
    pub fn lerp(a: &Viewport, b: &Viewport, t: f64) -> Viewport {
        let t = t.clamp(0.0, 1.0);
        Viewport {
            x: a.x + (b.x - a.x) * t,
            y: a.y + (b.y - a.y) * t,
            w: a.w + (b.w - a.w) * t,
            h: a.h + (b.h - a.h) * t,
        }
    }

    /// Map a frame-normalized point into this viewport's own `[0, 1]`
    /// space, or `None` when it lies outside.
    pub fn to_local(&self, px: f64, py: f64) -> Option<(f64, f64)> {
        if !self.contains(px, py) {
            return None;
        }
        Some(((px - self.x) / self.w, (py - self.y) / self.h))
    }

    /// The pixel rectangle this viewport covers in a `width x height` image.
    ///
    /// Always at least 1x1 and fully inside the image.
    pub fn pixel_rect(&self, width: u32, height: u32) -> PixelRect {
        let px = |v: f64, extent: u32| (v * extent as f64).round().clamp(0.0, extent as f64) as u32;
        let x = px(self.x, width).min(width.saturating_sub(1));
        let y = px(self.y, height).min(height.saturating_sub(1));
        let right = px(self.right(), width).max(x + 1).min(width.max(1));
        let bottom = px(self.bottom(), height).max(y + 1).min(height.max(1));
        PixelRect {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::FULL
    }
}
