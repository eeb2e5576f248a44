//! Per-frame compositing parameters.
//!
//! The editing layer owns how these values are authored; the export
//! pipeline only asks a [`CompositeSource`] for the parameters at a given
//! effective time and hands them to the renderer with the frame.

use serde::{Deserialize, Serialize};

use crate::viewport::Viewport;

/// Everything the renderer needs to compose one output frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeParams {
    /// Region of the source frame to show (zoom/crop).
    pub viewport: Viewport,

    /// Inset of the video inside the output canvas, as a fraction of the
    /// shorter output edge.
    #[serde(default)]
    pub padding: f64,

    /// Canvas background colour (RGBA).
    #[serde(default = "default_background")]
    pub background: [u8; 4],

    /// Optional cursor highlight, in capture-normalized coordinates.
    #[serde(default)]
    pub cursor: Option<CursorHighlight>,
}

/// Cursor highlight drawn on top of the composed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorHighlight {
    /// X position (capture-normalized).
    pub x: f64,
    /// Y position (capture-normalized).
    pub y: f64,
    /// Radius as a fraction of the output height.
    pub radius: f64,
    /// Highlight colour (RGBA, alpha blended).
    pub color: [u8; 4],
}

fn default_background() -> [u8; 4] {
    [0, 0, 0, 255]
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            viewport: Viewport::FULL,
            padding: 0.0,
            background: default_background(),
            cursor: None,
        }
    }
}

/// "Composite parameters at time T", supplied by the editing layer.
pub trait CompositeSource: Send + Sync {
    /// Parameters for the frame shown at `effective_time_ms`.
    fn params_at(&self, effective_time_ms: f64) -> CompositeParams;
}

impl<F> CompositeSource for F
where
    F: Fn(f64) -> CompositeParams + Send + Sync,
{
    fn params_at(&self, effective_time_ms: f64) -> CompositeParams {
        self(effective_time_ms)
    }
}

/// The same parameters for every frame.
#[derive(Debug, Clone, Default)]
pub struct StaticComposite(pub CompositeParams);

impl CompositeSource for StaticComposite {
    fn params_at(&self, _effective_time_ms: f64) -> CompositeParams {
        self.0.clone()
    }
}

/// A viewport keyframe on the effective timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportKeyframe {
    pub time_ms: f64,
    pub viewport: Viewport,
}

/// Linear interpolation between viewport keyframes, on top of a base set
/// of parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyframedComposite {
    pub base: CompositeParams,
    keyframes: Vec<ViewportKeyframe>,
}

impl KeyframedComposite {
    /// Build from keyframes in any order.
    pub fn new(base: CompositeParams, mut keyframes: Vec<ViewportKeyframe>) -> Self {
        keyframes.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));
        Self { base, keyframes }
    }

    /// Parse keyframes from a JSON array of `{time_ms, viewport}` objects.
    pub fn from_json(base: CompositeParams, json: &str) -> Result<Self, serde_json::Error> {
        let keyframes: Vec<ViewportKeyframe> = serde_json::from_str(json)?;
        Ok(Self::new(base, keyframes))
    }

    pub fn keyframes(&self) -> &[ViewportKeyframe] {
        &self.keyframes
    }

    /// Interpolated viewport at `time_ms`, holding the first/last keyframe
    /// outside the keyframed range.
    pub fn viewport_at(&self, time_ms: f64) -> Viewport {
        let Some(first) = self.keyframes.first() else {
            return self.base.viewport;
        };
        if time_ms <= first.time_ms {
            return first.viewport;
        }
        let upper = self.keyframes.partition_point(|kf| kf.time_ms <= time_ms);
        if upper >= self.keyframes.len() {
            return self.keyframes[self.keyframes.len() - 1].viewport;
        }
        let a = &self.keyframes[upper - 1];
        let b = &self.keyframes[upper];
        let span = b.time_ms - a.time_ms;
        if span <= f64::EPSILON {
            return b.viewport;
        }
        Viewport::lerp(&a.viewport, &b.viewport, (time_ms - a.time_ms) / span)
    }
}

impl CompositeSource for KeyframedComposite {
    fn params_at(&self, effective_time_ms: f64) -> CompositeParams {
        CompositeParams {
            viewport: self.viewport_at(effective_time_ms),
            ..self.base.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_a_composite_source() {
        let source = |t: f64| CompositeParams {
            padding: t / 1_000.0,
            ..CompositeParams::default()
        };
        assert!((source.params_at(500.0).padding - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_keyframes_interpolate_and_hold() {
        let zoomed = Viewport::new(0.25, 0.25, 0.5, 0.5);
        let composite = KeyframedComposite::new(
            CompositeParams::default(),
            vec![
                ViewportKeyframe {
                    time_ms: 1_000.0,
                    viewport: zoomed,
                },
                ViewportKeyframe {
                    time_ms: 0.0,
                    viewport: Viewport::FULL,
                },
            ],
        );

        assert_eq!(composite.viewport_at(-10.0), Viewport::FULL);
        let mid = composite.viewport_at(500.0);
        assert!((mid.w - 0.75).abs() < 1e-9);
        assert_eq!(composite.viewport_at(5_000.0), zoomed);
    }

    #[test]
    fn test_keyframes_from_json() {
        let json = r#"[{"time_ms": 0.0, "viewport": {"x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0}}]"#;
        let composite = KeyframedComposite::from_json(CompositeParams::default(), json).unwrap();
        assert_eq!(composite.keyframes().len(), 1);
        assert_eq!(composite.params_at(10.0).viewport, Viewport::FULL);
    }

    #[test]
    fn test_empty_keyframes_use_base() {
        let base = CompositeParams {
            viewport: Viewport::new(0.1, 0.1, 0.5, 0.5),
            ..CompositeParams::default()
        };
        let composite = KeyframedComposite::new(base.clone(), Vec::new());
        assert_eq!(composite.params_at(42.0), base);
    }
}
