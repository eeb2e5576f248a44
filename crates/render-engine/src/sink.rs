//! Encoder sinks: where ordered output frames end up.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use grabme_common::config::EncoderDefaults;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_decode::{command_exists, RgbaImage};
use grabme_demux::RawMp4Writer;

/// Export container/codec combination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp4H264,
    Mp4H265,
    Gif,
    Webm,
    /// Uncompressed RGB MP4, written without external tools.
    RawMp4,
}

impl OutputFormat {
    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "mov" | "m4v" => Some(Self::Mp4H264),
            "gif" => Some(Self::Gif),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mp4H264 => "mp4-h264",
            Self::Mp4H265 => "mp4-h265",
            Self::Gif => "gif",
            Self::Webm => "webm",
            Self::RawMp4 => "raw-mp4",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" | "h264" | "mp4-h264" => Ok(Self::Mp4H264),
            "h265" | "hevc" | "mp4-h265" => Ok(Self::Mp4H265),
            "gif" => Ok(Self::Gif),
            "webm" | "vp9" => Ok(Self::Webm),
            "raw" | "raw-mp4" => Ok(Self::RawMp4),
            other => Err(PipelineError::config(format!("unknown output format '{other}'"))),
        }
    }
}

/// Everything a sink needs before the first frame.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub output_path: PathBuf,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_bitrate_kbps: u32,
    pub preset: String,
    pub pixel_format: String,
}

impl EncoderSettings {
    pub fn new(
        output_path: impl Into<PathBuf>,
        format: OutputFormat,
        width: u32,
        height: u32,
        fps: f64,
        defaults: &EncoderDefaults,
    ) -> Self {
        Self {
            output_path: output_path.into(),
            format,
            width,
            height,
            fps,
            video_bitrate_kbps: defaults.video_bitrate_kbps,
            preset: defaults.preset.clone(),
            pixel_format: defaults.pixel_format.clone(),
        }
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    fn check_frame(&self, index: u64, image: &RgbaImage) -> PipelineResult<()> {
        if image.width() != self.width || image.height() != self.height {
            return Err(PipelineError::encode(format!(
                "frame {index} is {}x{}, encoder expects {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// What a finished sink produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SinkSummary {
    pub frames_written: u64,
    pub duration_ms: f64,
    pub output_path: Option<PathBuf>,
    pub output_bytes: Option<u64>,
}

/// Consumer of ordered output frames.
#[async_trait::async_trait]
pub trait EncoderSink: Send {
    fn name(&self) -> &'static str;

    async fn start(&mut self, settings: &EncoderSettings) -> PipelineResult<()>;

    /// Encode the frame at output position `index`. Frames arrive in order.
    async fn encode(&mut self, index: u64, image: RgbaImage) -> PipelineResult<()>;

    async fn finish(&mut self) -> PipelineResult<SinkSummary>;

    /// Tear down after a failed or cancelled export. Idempotent.
    async fn abort(&mut self);
}

/// ffmpeg codec arguments for `settings`.
pub fn codec_args(settings: &EncoderSettings) -> Vec<String> {
    let video_bitrate = format!("{}k", settings.video_bitrate_kbps.max(1000));

    match settings.format {
        OutputFormat::Mp4H264 => vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            settings.preset.clone(),
            "-profile:v".to_string(),
            "high".to_string(),
            "-pix_fmt".to_string(),
            settings.pixel_format.clone(),
            "-b:v".to_string(),
            video_bitrate,
            "-movflags".to_string(),
            "+faststart".to_string(),
        ],
        OutputFormat::Mp4H265 => vec![
            "-c:v".to_string(),
            "libx265".to_string(),
            "-preset".to_string(),
            settings.preset.clone(),
            "-pix_fmt".to_string(),
            settings.pixel_format.clone(),
            "-b:v".to_string(),
            video_bitrate,
            "-movflags".to_string(),
            "+faststart".to_string(),
        ],
        OutputFormat::Gif => vec![
            "-vf".to_string(),
            "fps=15,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse".to_string(),
        ],
        OutputFormat::Webm => vec![
            "-c:v".to_string(),
            "libvpx-vp9".to_string(),
            "-b:v".to_string(),
            video_bitrate,
            "-pix_fmt".to_string(),
            settings.pixel_format.clone(),
        ],
        OutputFormat::RawMp4 => Vec::new(),
    }
}

/// Full ffmpeg argument list for piping raw RGBA frames in on stdin.
pub fn ffmpeg_args(settings: &EncoderSettings) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{}x{}", settings.width, settings.height),
        "-r".to_string(),
        format!("{:.6}", settings.fps),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-an".to_string(),
    ];
    args.extend(codec_args(settings));
    args.push(settings.output_path.display().to_string());
    args
}

struct RunningEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
}

impl RunningEncoder {
    async fn collect_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|_| "<failed to join stderr reader>".to_string()),
            None => String::new(),
        }
    }

    async fn wait(&mut self) -> PipelineResult<(ExitStatus, String)> {
        // Closing stdin is ffmpeg's end-of-stream.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let status = self.child.wait().await?;
        let stderr = self.collect_stderr().await;
        Ok((status, stderr))
    }
}

/// Pipes RGBA frames into an `ffmpeg` child process.
#[derive(Default)]
pub struct FfmpegEncoderSink {
    settings: Option<EncoderSettings>,
    running: Option<RunningEncoder>,
    frames_written: u64,
}

impl FfmpegEncoderSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&mut self) -> PipelineResult<&mut RunningEncoder> {
        self.running
            .as_mut()
            .ok_or(PipelineError::Closed { component: "ffmpeg encoder" })
    }

    /// Turn a pipe failure into an error carrying ffmpeg's own message.
    async fn pipe_failure(&mut self, index: u64, err: std::io::Error) -> PipelineError {
        let stderr = match self.running.as_mut() {
            Some(running) => {
                let _ = running.child.start_kill();
                running.stdin = None;
                running.collect_stderr().await
            }
            None => String::new(),
        };
        PipelineError::encode(format!(
            "ffmpeg stopped accepting frames at {index}: {err}: {}",
            stderr.trim()
        ))
    }
}

#[async_trait::async_trait]
impl EncoderSink for FfmpegEncoderSink {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn start(&mut self, settings: &EncoderSettings) -> PipelineResult<()> {
        if self.running.is_some() {
            return Err(PipelineError::encode("ffmpeg encoder already started"));
        }
        if settings.format == OutputFormat::RawMp4 {
            return Err(PipelineError::config(
                "raw MP4 output is written by RawMp4Sink, not ffmpeg",
            ));
        }
        if !command_exists("ffmpeg") {
            return Err(PipelineError::encode(
                "No supported encoder found (expected ffmpeg in PATH)",
            ));
        }
        if let Some(parent) = settings.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let args = ffmpeg_args(settings);
        debug!(?args, "Starting ffmpeg encoder");
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::encode(format!("Failed to start ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::encode("Failed to capture ffmpeg stdin"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::encode("Failed to capture ffmpeg stderr"))?;

        // Drain stderr concurrently so ffmpeg never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut output = String::new();
            match stderr.read_to_string(&mut output).await {
                Ok(_) => output,
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        info!(
            pid = child.id(),
            output = %settings.output_path.display(),
            format = %settings.format,
            "ffmpeg encoder started"
        );
        self.running = Some(RunningEncoder {
            child,
            stdin: Some(stdin),
            stderr: Some(stderr_task),
        });
        self.settings = Some(settings.clone());
        self.frames_written = 0;
        Ok(())
    }

    async fn encode(&mut self, index: u64, image: RgbaImage) -> PipelineResult<()> {
        let settings = self
            .settings
            .as_ref()
            .ok_or(PipelineError::Closed { component: "ffmpeg encoder" })?;
        settings.check_frame(index, &image)?;
        debug_assert_eq!(image.data().len(), settings.frame_len());

        let stdin = self
            .running()?
            .stdin
            .as_mut()
            .ok_or(PipelineError::Closed { component: "ffmpeg encoder" })?;
        if let Err(err) = stdin.write_all(image.data()).await {
            return Err(self.pipe_failure(index, err).await);
        }
        self.frames_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> PipelineResult<SinkSummary> {
        let settings = self
            .settings
            .clone()
            .ok_or(PipelineError::Closed { component: "ffmpeg encoder" })?;
        let mut running = self
            .running
            .take()
            .ok_or(PipelineError::Closed { component: "ffmpeg encoder" })?;

        let (status, stderr) = running.wait().await?;
        if !status.success() {
            return Err(PipelineError::encode(format!(
                "ffmpeg export failed (status {status}): {}",
                stderr.trim()
            )));
        }

        let output_bytes = tokio::fs::metadata(&settings.output_path)
            .await
            .map(|meta| meta.len())
            .ok();
        let summary = SinkSummary {
            frames_written: self.frames_written,
            duration_ms: self.frames_written as f64 * 1_000.0 / settings.fps.max(1e-6),
            output_path: Some(settings.output_path.clone()),
            output_bytes,
        };
        info!(
            frames = summary.frames_written,
            bytes = ?summary.output_bytes,
            "ffmpeg encoder finished"
        );
        Ok(summary)
    }

    async fn abort(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.stdin = None;
            if let Err(err) = running.child.start_kill() {
                warn!(error = %err, "Failed to kill ffmpeg encoder");
            }
            let _ = running.child.wait().await;
            let stderr = running.collect_stderr().await;
            debug!(stderr = %stderr.trim(), "ffmpeg encoder aborted");
        }
    }
}

/// Keeps every frame in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    settings: Option<EncoderSettings>,
    frames: Vec<(u64, RgbaImage)>,
    finished: bool,
    aborted: bool,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> Option<&EncoderSettings> {
        self.settings.as_ref()
    }

    pub fn frames(&self) -> &[(u64, RgbaImage)] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<(u64, RgbaImage)> {
        self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

#[async_trait::async_trait]
impl EncoderSink for CollectingSink {
    fn name(&self) -> &'static str {
        "collect"
    }

    async fn start(&mut self, settings: &EncoderSettings) -> PipelineResult<()> {
        self.settings = Some(settings.clone());
        self.frames.clear();
        self.finished = false;
        self.aborted = false;
        Ok(())
    }

    async fn encode(&mut self, index: u64, image: RgbaImage) -> PipelineResult<()> {
        let settings = self
            .settings
            .as_ref()
            .ok_or(PipelineError::Closed { component: "collecting sink" })?;
        if self.finished || self.aborted {
            return Err(PipelineError::Closed {
                component: "collecting sink",
            });
        }
        settings.check_frame(index, &image)?;
        self.frames.push((index, image));
        Ok(())
    }

    async fn finish(&mut self) -> PipelineResult<SinkSummary> {
        let settings = self
            .settings
            .as_ref()
            .ok_or(PipelineError::Closed { component: "collecting sink" })?;
        self.finished = true;
        let frames_written = self.frames.len() as u64;
        Ok(SinkSummary {
            frames_written,
            duration_ms: frames_written as f64 * 1_000.0 / settings.fps.max(1e-6),
            output_path: None,
            output_bytes: None,
        })
    }

    async fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Writes uncompressed RGB MP4 through [`RawMp4Writer`].
#[derive(Default)]
pub struct RawMp4Sink {
    settings: Option<EncoderSettings>,
    writer: Option<RawMp4Writer<BufWriter<File>>>,
    rgb: Vec<u8>,
}

impl RawMp4Sink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EncoderSink for RawMp4Sink {
    fn name(&self) -> &'static str {
        "raw-mp4"
    }

    async fn start(&mut self, settings: &EncoderSettings) -> PipelineResult<()> {
        let fps = settings.fps.round().max(1.0) as u32;
        if (settings.fps - fps as f64).abs() > 1e-3 {
            warn!(fps = settings.fps, rounded = fps, "Raw MP4 uses an integral frame rate");
        }
        let path = settings.output_path.clone();
        let (width, height) = (settings.width, settings.height);
        let writer = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            RawMp4Writer::create(&path, width, height, fps)
        })
        .await
        .map_err(|e| PipelineError::encode(format!("raw MP4 writer task failed: {e}")))??;
        self.writer = Some(writer);
        self.settings = Some(settings.clone());
        Ok(())
    }

    async fn encode(&mut self, index: u64, image: RgbaImage) -> PipelineResult<()> {
        let settings = self
            .settings
            .as_ref()
            .ok_or(PipelineError::Closed { component: "raw MP4 sink" })?;
        settings.check_frame(index, &image)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or(PipelineError::Closed { component: "raw MP4 sink" })?;

        self.rgb.clear();
        self.rgb.reserve(image.data().len() / 4 * 3);
        for px in image.data().chunks_exact(4) {
            self.rgb.extend_from_slice(&px[..3]);
        }
        writer.write_frame(&self.rgb)
    }

    async fn finish(&mut self) -> PipelineResult<SinkSummary> {
        let settings = self
            .settings
            .clone()
            .ok_or(PipelineError::Closed { component: "raw MP4 sink" })?;
        let writer = self
            .writer
            .take()
            .ok_or(PipelineError::Closed { component: "raw MP4 sink" })?;
        let frames_written = writer.frame_count() as u64;
        tokio::task::spawn_blocking(move || writer.finish().map(drop))
            .await
            .map_err(|e| PipelineError::encode(format!("raw MP4 writer task failed: {e}")))??;

        let output_bytes = tokio::fs::metadata(&settings.output_path)
            .await
            .map(|meta| meta.len())
            .ok();
        Ok(SinkSummary {
            frames_written,
            duration_ms: frames_written as f64 * 1_000.0 / settings.fps.round().max(1.0),
            output_path: Some(settings.output_path),
            output_bytes,
        })
    }

    async fn abort(&mut self) {
        if self.writer.take().is_some() {
            if let Some(settings) = &self.settings {
                let _ = tokio::fs::remove_file(&settings.output_path).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(format: OutputFormat) -> EncoderSettings {
        EncoderSettings::new(
            "/tmp/out.mp4",
            format,
            64,
            32,
            30.0,
            &EncoderDefaults::default(),
        )
    }

    #[test]
    fn test_h264_args_use_central_bitrate() {
        let args = codec_args(&settings(OutputFormat::Mp4H264));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "8000k"]));
        assert!(args.contains(&"+faststart".to_string()));
    }

    #[test]
    fn test_ffmpeg_args_describe_raw_input() {
        let args = ffmpeg_args(&settings(OutputFormat::Webm));
        assert!(args.windows(2).any(|w| w == ["-s", "64x32"]));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "rgba"]));
        assert!(args.contains(&"libvpx-vp9".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("gif".parse::<OutputFormat>().unwrap(), OutputFormat::Gif);
        assert_eq!("HEVC".parse::<OutputFormat>().unwrap(), OutputFormat::Mp4H265);
        assert!("avi".parse::<OutputFormat>().is_err());
        assert_eq!(
            OutputFormat::from_path(Path::new("clip.WEBM")),
            Some(OutputFormat::Webm)
        );
    }

    #[tokio::test]
    async fn test_collecting_sink_checks_frame_size() {
        let mut sink = CollectingSink::new();
        sink.start(&settings(OutputFormat::Mp4H264)).await.unwrap();
        sink.encode(0, RgbaImage::filled(64, 32, [0; 4]).unwrap())
            .await
            .unwrap();
        assert!(sink
            .encode(1, RgbaImage::filled(32, 32, [0; 4]).unwrap())
            .await
            .is_err());

        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.frames_written, 1);
        assert!((summary.duration_ms - 1_000.0 / 30.0).abs() < 1e-9);
    }
}
