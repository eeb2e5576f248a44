//! Fallback path: one seek-and-extract per requested frame.
//!
//! Slow but dependable. Each extraction runs under the configured seek
//! timeout, since an external tool can stall indefinitely on odd inputs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use grabme_common::clock::{ms_to_us, FrameTimebase};
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_decode::{command_exists, DecodedFrame, RgbaImage};

use super::{FrameSource, SourceCapabilities, SourceMode, SourceOptions, SourceStats};

const COMPONENT: &str = "fallback frame source";

/// Stream metadata reported by a [`FrameExtractor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_ms: f64,
    pub frame_count: u64,
    pub codec: String,
}

/// Random-access frame extraction.
#[async_trait::async_trait]
pub trait FrameExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, path: &Path) -> PipelineResult<MediaProbe>;

    /// The frame shown at `time_ms`, scaled to `width x height`.
    /// `Ok(None)` means there is no frame at that time.
    async fn extract(
        &self,
        path: &Path,
        time_ms: f64,
        width: u32,
        height: u32,
    ) -> PipelineResult<Option<RgbaImage>>;
}

/// Extractor that runs `ffprobe` once and a one-frame `ffmpeg -ss` per
/// request. Child processes are killed when a timed-out call is dropped.
#[derive(Debug, Default)]
pub struct FfmpegSeekExtractor {
    available: OnceLock<bool>,
}

impl FfmpegSeekExtractor {
    fn ensure_available(&self) -> PipelineResult<()> {
        let available = *self
            .available
            .get_or_init(|| command_exists("ffmpeg") && command_exists("ffprobe"));
        if available {
            Ok(())
        } else {
            Err(PipelineError::config(
                "seek-based extraction needs ffmpeg and ffprobe in PATH",
            ))
        }
    }
}

#[async_trait::async_trait]
impl FrameExtractor for FfmpegSeekExtractor {
    fn name(&self) -> &'static str {
        "ffmpeg-seek"
    }

    async fn probe(&self, path: &Path) -> PipelineResult<MediaProbe> {
        self.ensure_available()?;
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=codec_name,width,height,avg_frame_rate,r_frame_rate,nb_frames,duration:format=duration",
                "-of",
                "json",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(PipelineError::container(format!(
                "ffprobe failed (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }

    async fn extract(
        &self,
        path: &Path,
        time_ms: f64,
        width: u32,
        height: u32,
    ) -> PipelineResult<Option<RgbaImage>> {
        self.ensure_available()?;
        let seek = format!("{:.6}", time_ms.max(0.0) / 1_000.0);
        let scale = format!("scale={width}:{height}");
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-ss", seek.as_str(), "-i"])
            .arg(path)
            .args([
                "-frames:v",
                "1",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-vf",
                scale.as_str(),
                "pipe:1",
            ])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(PipelineError::decode(format!(
                "ffmpeg extraction at {time_ms:.3}ms failed (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Ok(None);
        }
        RgbaImage::new(width, height, output.stdout).map(Some)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001`; `0/0` yields `None`.
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    let fps = num / den;
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn parse_probe(json: &str) -> PipelineResult<MediaProbe> {
    let parsed: ProbeOutput = serde_json::from_str(json)?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::container("no video stream found"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(PipelineError::container("video stream has no dimensions")),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(30.0);
    let duration_secs = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            parsed
                .format
                .and_then(|f| f.duration)
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0);
    let duration_ms = duration_secs * 1_000.0;
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or_else(|| FrameTimebase::new(fps).frames_in(duration_ms));

    Ok(MediaProbe {
        width,
        height,
        fps,
        duration_ms,
        frame_count,
        codec: stream.codec_name.unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Frame source that extracts every frame by seeking.
pub struct SeekFrameSource {
    path: PathBuf,
    options: SourceOptions,
    probe: Option<MediaProbe>,
    timebase: FrameTimebase,
    /// Last extracted frame, repeated for requests inside its tolerance.
    cache: tokio::sync::Mutex<Option<DecodedFrame>>,
    counters: Mutex<SourceStats>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
}

impl SeekFrameSource {
    pub fn new(path: impl AsRef<Path>, options: SourceOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            probe: None,
            timebase: FrameTimebase::new(30.0),
            cache: tokio::sync::Mutex::new(None),
            counters: Mutex::new(SourceStats::default()),
            cancel: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> PipelineResult<&MediaProbe> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed {
                component: COMPONENT,
            });
        }
        self.probe
            .as_ref()
            .ok_or_else(|| PipelineError::config("fallback source used before initialize()"))
    }

    fn capabilities(&self, probe: &MediaProbe) -> SourceCapabilities {
        SourceCapabilities {
            mode: SourceMode::Fallback,
            width: probe.width,
            height: probe.height,
            fps: probe.fps,
            duration_ms: probe.duration_ms,
            frame_count: probe.frame_count,
            codec: probe.codec.clone(),
        }
    }

    fn record_served(&self, started: Instant, held: bool) {
        let mut counters = self.counters.lock();
        counters.frames_served += 1;
        if held {
            counters.frames_held += 1;
        }
        counters.get_frame_latency.record(started.elapsed());
    }
}

#[async_trait::async_trait]
impl FrameSource for SeekFrameSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Fallback
    }

    async fn initialize(&mut self) -> PipelineResult<SourceCapabilities> {
        if let Some(probe) = &self.probe {
            return Ok(self.capabilities(probe));
        }
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed {
                component: COMPONENT,
            });
        }

        let after = self.options.pipeline.seek_timeout();
        let probe = tokio::time::timeout(after, self.options.extractor.probe(&self.path))
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: "fallback probe",
                after,
            })??;

        self.timebase = FrameTimebase::new(probe.fps);
        info!(
            path = %self.path.display(),
            extractor = self.options.extractor.name(),
            width = probe.width,
            height = probe.height,
            fps = probe.fps,
            "Fallback frame source ready"
        );
        let capabilities = self.capabilities(&probe);
        self.probe = Some(probe);
        Ok(capabilities)
    }

    async fn get_frame(&self, index: u64, effective_time_ms: f64) -> PipelineResult<DecodedFrame> {
        let started = Instant::now();
        let probe = self.check_open()?;
        let mut cache = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PipelineError::Closed { component: COMPONENT });
            }
            guard = self.cache.lock() => guard,
        };

        let mut source_ms = self.options.remap.to_source(effective_time_ms);
        if probe.duration_ms > 0.0 {
            // Past the end, the last frame is what is shown.
            let last_frame_ms = (probe.duration_ms - self.timebase.frame_duration_ms()).max(0.0);
            source_ms = source_ms.min(last_frame_ms);
        }
        let target_us = ms_to_us(source_ms);
        let tolerance = self.timebase.frame_duration_us() / 2;

        if let Some(cached) = cache.as_ref() {
            if (cached.timestamp_us() - target_us).abs() <= tolerance {
                let frame = cached.duplicate_at(cached.timestamp_us());
                self.record_served(started, false);
                return Ok(frame);
            }
        }

        let after = self.options.pipeline.seek_timeout();
        let extraction = self.options.extractor.extract(
            &self.path,
            source_ms,
            probe.width,
            probe.height,
        );
        let extracted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PipelineError::Closed { component: COMPONENT });
            }
            result = tokio::time::timeout(after, extraction) => result,
        };

        match extracted {
            Err(_) => Err(PipelineError::Timeout {
                operation: "fallback seek",
                after,
            }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(Some(image))) => {
                let frame = self.options.accounting.frame(
                    target_us,
                    self.timebase.frame_duration_us(),
                    image,
                );
                let served = frame.duplicate_at(target_us);
                *cache = Some(frame);
                self.record_served(started, false);
                trace!(index, source_ms, "frame extracted");
                Ok(served)
            }
            Ok(Ok(None)) => match cache.as_ref() {
                Some(cached) if cached.timestamp_us() <= target_us => {
                    let frame = cached.duplicate_at(target_us);
                    self.record_served(started, true);
                    debug!(index, source_ms, "no frame at seek target, holding previous");
                    Ok(frame)
                }
                _ => Err(PipelineError::FrameNotAvailable {
                    index,
                    time_ms: effective_time_ms,
                }),
            },
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Ok(mut cache) = self.cache.try_lock() {
            cache.take();
        }
        info!(path = %self.path.display(), "Fallback frame source destroyed");
    }

    fn stats(&self) -> SourceStats {
        let mut stats = self.counters.lock().clone();
        stats.mode = Some(SourceMode::Fallback);
        stats.accounting = Some(self.options.accounting.snapshot());
        stats
    }
}

impl Drop for SeekFrameSource {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("25"), Some(25.0));
    }

    #[test]
    fn test_parse_probe_prefers_stream_fields() {
        let json = r#"{
            "streams": [{
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "avg_frame_rate": "60/1",
                "r_frame_rate": "60/1",
                "nb_frames": "600",
                "duration": "10.000000"
            }],
            "format": { "duration": "10.050000" }
        }"#;
        let probe = parse_probe(json).unwrap();
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.fps, 60.0);
        assert_eq!(probe.frame_count, 600);
        assert!((probe.duration_ms - 10_000.0).abs() < 1e-6);
        assert_eq!(probe.codec, "h264");
    }

    #[test]
    fn test_parse_probe_falls_back_to_format_duration() {
        let json = r#"{
            "streams": [{ "width": 640, "height": 360, "avg_frame_rate": "0/0", "r_frame_rate": "30/1" }],
            "format": { "duration": "2.0" }
        }"#;
        let probe = parse_probe(json).unwrap();
        assert_eq!(probe.fps, 30.0);
        assert_eq!(probe.frame_count, 60);
        assert_eq!(probe.codec, "unknown");
    }

    #[test]
    fn test_parse_probe_without_video_stream() {
        let err = parse_probe(r#"{ "streams": [] }"#).unwrap_err();
        assert_eq!(err.kind(), "container");
    }
}
