//! Export configuration.
//!
//! Every queue size, timeout, and encoder default used by the pipeline
//! lives here so call sites never carry their own copies.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Hard cap on render workers. Throughput degrades beyond this on the
/// consumer hardware the pipeline targets.
pub const MAX_RENDER_WORKERS: usize = 4;

/// Persisted export configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfigFile {
    /// Queue sizes, worker count, and timeouts.
    pub pipeline: PipelineConfig,

    /// Output encoder defaults.
    pub encoder: EncoderDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Pipeline sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max chunks in flight inside the decoder.
    pub decoder_queue_size: usize,

    /// Max decoded frames held by the frame buffer.
    pub frame_buffer_capacity: usize,

    /// Max early render results held by the reassembler.
    pub reassembly_capacity: usize,

    /// Requested render worker count (clamped by [`PipelineConfig::effective_workers`]).
    pub worker_count: usize,

    /// Whether to try the parallel worker pool at all.
    pub parallel_render: bool,

    /// Max frames handed to the encoder but not yet written.
    pub encode_queue_size: usize,

    /// Bound on decoder flush.
    pub decoder_flush_timeout_ms: u64,

    /// Bound on a single fallback seek/extraction.
    pub seek_timeout_ms: u64,

    /// Bound on a single worker render before the worker is declared stuck.
    pub worker_task_timeout_ms: u64,

    /// Respawn-and-retry attempts after a worker crash.
    pub worker_max_retries: u32,

    /// Bound on waiting for in-flight renders during shutdown.
    pub shutdown_timeout_ms: u64,

    /// Forward distance past the decode position that triggers a keyframe
    /// seek instead of decoding through.
    pub seek_ahead_threshold_ms: u64,
}

/// Output encoder defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderDefaults {
    /// Video bitrate in kbps.
    pub video_bitrate_kbps: u32,

    /// Encoder speed preset (ffmpeg naming).
    pub preset: String,

    /// Output pixel format passed to the encoder.
    pub pixel_format: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "grabme_render_engine=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path (appended to instead of stderr).
    pub file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decoder_queue_size: 8,
            frame_buffer_capacity: 16,
            reassembly_capacity: 32,
            worker_count: MAX_RENDER_WORKERS,
            parallel_render: true,
            encode_queue_size: 8,
            decoder_flush_timeout_ms: 5_000,
            seek_timeout_ms: 10_000,
            worker_task_timeout_ms: 30_000,
            worker_max_retries: 2,
            shutdown_timeout_ms: 5_000,
            seek_ahead_threshold_ms: 3_000,
        }
    }
}

impl Default for EncoderDefaults {
    fn default() -> Self {
        Self {
            video_bitrate_kbps: 8000,
            preset: "medium".to_string(),
            pixel_format: "yuv420p".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl PipelineConfig {
    /// Reject zero capacities and out-of-range worker counts.
    pub fn validate(&self) -> PipelineResult<()> {
        let sizes = [
            ("decoder_queue_size", self.decoder_queue_size),
            ("frame_buffer_capacity", self.frame_buffer_capacity),
            ("reassembly_capacity", self.reassembly_capacity),
            ("encode_queue_size", self.encode_queue_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(PipelineError::config(format!("{name} must be > 0")));
            }
        }
        if self.worker_count == 0 {
            return Err(PipelineError::config("worker_count must be > 0"));
        }
        if self.worker_count > MAX_RENDER_WORKERS {
            return Err(PipelineError::config(format!(
                "worker_count {} exceeds the validated maximum of {MAX_RENDER_WORKERS}",
                self.worker_count
            )));
        }
        Ok(())
    }

    /// Worker count actually used: the requested count clamped to
    /// `1..=MAX_RENDER_WORKERS` and to the host's available parallelism.
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.worker_count
            .clamp(1, MAX_RENDER_WORKERS)
            .min(available.max(1))
    }

    pub fn decoder_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.decoder_flush_timeout_ms)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    pub fn worker_task_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_task_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl ExportConfigFile {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from `path`, falling back to defaults on any problem.
    pub fn load_from(path: &std::path::Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<Self>(&content) {
                    Ok(config) => match config.pipeline.validate() {
                        Ok(()) => return config,
                        Err(e) => {
                            tracing::warn!("Ignoring invalid config at {:?}: {}", path, e);
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&config_file_path())
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("grabme").join("export.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_buffer_capacity, 16);
        assert_eq!(config.decoder_queue_size, 8);
        assert_eq!(config.reassembly_capacity, 32);
        assert_eq!(config.decoder_flush_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_worker_count_is_bounded() {
        let config = PipelineConfig {
            worker_count: 64,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.effective_workers() <= MAX_RENDER_WORKERS);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = PipelineConfig {
            encode_queue_size: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ExportConfigFile =
            serde_json::from_str(r#"{ "pipeline": { "worker_count": 2 } }"#).unwrap();
        assert_eq!(config.pipeline.worker_count, 2);
        assert_eq!(config.pipeline.encode_queue_size, 8);
        assert_eq!(config.encoder.video_bitrate_kbps, 8000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("grabme-config-{}", std::process::id()));
        let path = dir.join("export.json");
        let mut config = ExportConfigFile::default();
        config.pipeline.worker_count = 3;
        config.save_to(&path).unwrap();
        let loaded = ExportConfigFile::load_from(&path);
        assert_eq!(loaded.pipeline, config.pipeline);
        std::fs::remove_dir_all(dir).ok();
    }
}
