//! Lightweight latency and throughput counters used by component stats.

use std::time::Duration;

use serde::Serialize;

/// Running latency aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Number of samples recorded.
    pub samples: u64,
    /// Sum of all samples in milliseconds.
    pub total_ms: f64,
    /// Largest sample seen in milliseconds.
    pub max_ms: f64,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1_000.0;
        self.samples += 1;
        self.total_ms += ms;
        if ms > self.max_ms {
            self.max_ms = ms;
        }
    }

    /// Mean latency in milliseconds (0 when empty).
    pub fn average_ms(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.total_ms / self.samples as f64
    }
}

/// Processed vs dropped frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounters {
    /// Frames that made it through the stage.
    pub processed: u64,
    /// Frames discarded by the stage (evicted, skipped, lost).
    pub dropped: u64,
}

impl FrameCounters {
    /// Drop rate as a percentage.
    pub fn drop_rate(&self) -> f64 {
        let total = self.processed + self.dropped;
        if total == 0 {
            return 0.0;
        }
        self.dropped as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average_and_max() {
        let mut stats = LatencyStats::default();
        assert_eq!(stats.average_ms(), 0.0);
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.samples, 2);
        assert!((stats.average_ms() - 20.0).abs() < 1e-6);
        assert!((stats.max_ms - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_drop_rate() {
        let counters = FrameCounters {
            processed: 90,
            dropped: 10,
        };
        assert!((counters.drop_rate() - 10.0).abs() < 1e-9);
        assert_eq!(FrameCounters::default().drop_rate(), 0.0);
    }
}
