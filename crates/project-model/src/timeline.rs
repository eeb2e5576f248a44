//! Trim regions and effective-to-source time remapping.
//!
//! The exported timeline ("effective time") is the recording with every
//! trimmed region removed. Frame sources receive effective times and use
//! [`TimeRemap`] to find the matching source time.

use serde::{Deserialize, Serialize};

use grabme_common::error::{PipelineError, PipelineResult};

/// A cut: the half-open source interval `[start_ms, end_ms)` is removed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimRegion {
    pub start_ms: f64,
    pub end_ms: f64,
}

impl TrimRegion {
    pub fn new(start_ms: f64, end_ms: f64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> f64 {
        (self.end_ms - self.start_ms).max(0.0)
    }

    pub fn contains(&self, source_ms: f64) -> bool {
        source_ms >= self.start_ms && source_ms < self.end_ms
    }
}

/// Monotonic mapping between effective and source time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRemap {
    /// Sorted, non-overlapping cuts.
    cuts: Vec<TrimRegion>,
}

impl TimeRemap {
    /// No trims: effective time equals source time.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Build a remap from cuts in any order. Overlapping or touching cuts
    /// are merged; empty or inverted cuts are rejected.
    pub fn new(mut cuts: Vec<TrimRegion>) -> PipelineResult<Self> {
        for cut in &cuts {
            if !cut.start_ms.is_finite() || !cut.end_ms.is_finite() {
                return Err(PipelineError::config("trim region bounds must be finite"));
            }
            if cut.end_ms <= cut.start_ms {
                return Err(PipelineError::config(format!(
                    "trim region [{}, {}) is empty or inverted",
                    cut.start_ms, cut.end_ms
                )));
            }
        }
        cuts.sort_by(|a, b| a.start_ms.total_cmp(&b.start_ms));

        let mut merged: Vec<TrimRegion> = Vec::with_capacity(cuts.len());
        for cut in cuts {
            match merged.last_mut() {
                Some(last) if cut.start_ms <= last.end_ms => {
                    last.end_ms = last.end_ms.max(cut.end_ms);
                }
                _ => merged.push(cut),
            }
        }
        Ok(Self { cuts: merged })
    }

    pub fn cuts(&self) -> &[TrimRegion] {
        &self.cuts
    }

    pub fn is_identity(&self) -> bool {
        self.cuts.is_empty()
    }

    /// Source time shown at `effective_ms`.
    pub fn to_source(&self, effective_ms: f64) -> f64 {
        let mut source = effective_ms.max(0.0);
        for cut in &self.cuts {
            if source >= cut.start_ms {
                // Anchor on end_ms so the result never lands inside the cut.
                source = cut.end_ms + (source - cut.start_ms);
            } else {
                break;
            }
        }
        source
    }

    /// Effective time of `source_ms`, or `None` if it falls inside a cut.
    pub fn to_effective(&self, source_ms: f64) -> Option<f64> {
        let mut removed = 0.0;
        for cut in &self.cuts {
            if cut.contains(source_ms) {
                return None;
            }
            if source_ms >= cut.end_ms {
                removed += cut.duration_ms();
            } else {
                break;
            }
        }
        Some(source_ms - removed)
    }

    /// Exported duration for a recording of `source_duration_ms`.
    pub fn effective_duration(&self, source_duration_ms: f64) -> f64 {
        let removed: f64 = self
            .cuts
            .iter()
            .map(|cut| {
                let end = cut.end_ms.min(source_duration_ms);
                (end - cut.start_ms).max(0.0)
            })
            .sum();
        (source_duration_ms - removed).max(0.0)
    }
}
