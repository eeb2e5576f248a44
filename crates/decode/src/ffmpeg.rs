//! H.264/HEVC decoding through an `ffmpeg` child process.
//!
//! Annex-B chunks are written to ffmpeg's stdin; RGBA frames come back on
//! stdout. ffmpeg emits frames in presentation order without timestamps,
//! so each output takes the smallest submitted timestamp not yet used.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::OnceLock;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver};
use tracing::{debug, warn};

use grabme_common::error::{PipelineError, PipelineResult};
use grabme_demux::{DecoderConfig, EncodedChunk, VideoCodec};

use crate::backend::{DecodedImage, DecoderBackend, VideoDecoder};
use crate::frame::RgbaImage;

/// Whether `binary` resolves on `PATH`.
pub fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Backend that shells out to `ffmpeg`. Availability is checked once.
#[derive(Debug, Default)]
pub struct FfmpegPipeBackend {
    available: OnceLock<bool>,
}

impl DecoderBackend for FfmpegPipeBackend {
    fn name(&self) -> &'static str {
        "ffmpeg-pipe"
    }

    fn supports(&self, config: &DecoderConfig) -> bool {
        matches!(config.codec, VideoCodec::H264 | VideoCodec::Hevc)
            && config.width > 0
            && config.height > 0
            && *self.available.get_or_init(|| command_exists("ffmpeg"))
    }

    fn create(&self) -> PipelineResult<Box<dyn VideoDecoder>> {
        Ok(Box::new(FfmpegPipeDecoder::default()))
    }
}

struct Process {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<String>>,
}

#[derive(Debug, Clone)]
struct StreamFormat {
    input: &'static str,
    width: u32,
    height: u32,
}

/// Streaming decoder over one ffmpeg process per configure/flush cycle.
#[derive(Default)]
pub struct FfmpegPipeDecoder {
    format: Option<StreamFormat>,
    process: Option<Process>,
    /// Submitted (timestamp, duration) pairs not yet matched to output.
    pending: BinaryHeap<Reverse<(i64, i64)>>,
    last_output: Option<(i64, i64)>,
}

impl FfmpegPipeDecoder {
    fn frame_size(format: &StreamFormat) -> usize {
        format.width as usize * format.height as usize * 4
    }

    fn spawn(format: &StreamFormat) -> PipelineResult<Process> {
        let scale = format!("scale={}:{}", format.width, format.height);
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                // Frame threading holds frames back; output must track input.
                "-threads",
                "1",
                "-f",
                format.input,
                "-i",
                "pipe:0",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-vf",
                scale.as_str(),
                "-vsync",
                "passthrough",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::decode(format!("failed to start ffmpeg: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::decode("failed to capture ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::decode("failed to capture ffmpeg stderr"))?;

        let frame_size = Self::frame_size(format);
        let (tx, rx) = unbounded();
        let reader = std::thread::Builder::new()
            .name("ffmpeg-decode-reader".into())
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    let mut frame = vec![0u8; frame_size];
                    if stdout.read_exact(&mut frame).is_err() || tx.send(frame).is_err() {
                        break;
                    }
                }
            })?;
        // Drain stderr so ffmpeg never blocks on a full pipe.
        let stderr = std::thread::Builder::new()
            .name("ffmpeg-decode-stderr".into())
            .spawn(move || {
                let mut output = String::new();
                if let Err(err) = BufReader::new(stderr).read_to_string(&mut output) {
                    output = format!("<failed to read ffmpeg stderr: {err}>");
                }
                output
            })?;

        debug!(pid = child.id(), input = format.input, "ffmpeg decoder started");
        Ok(Process {
            child,
            stdin,
            frames: rx,
            reader: Some(reader),
            stderr: Some(stderr),
        })
    }

    fn process(&mut self) -> PipelineResult<&mut Process> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| PipelineError::decode("ffmpeg decoder is not configured"))?;
        if self.process.is_none() {
            self.process = Some(Self::spawn(format)?);
        }
        self.process
            .as_mut()
            .ok_or_else(|| PipelineError::decode("ffmpeg process unavailable"))
    }

    fn wrap(&mut self, pixels: Vec<u8>) -> PipelineResult<DecodedImage> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| PipelineError::decode("ffmpeg decoder is not configured"))?;
        let image = RgbaImage::new(format.width, format.height, pixels)?;
        let (timestamp_us, duration_us) = match self.pending.pop() {
            Some(Reverse(entry)) => entry,
            None => {
                // More output than input: continue the cadence.
                let (ts, dur) = self.last_output.unwrap_or((0, 0));
                (ts + dur, dur)
            }
        };
        self.last_output = Some((timestamp_us, duration_us));
        Ok(DecodedImage {
            timestamp_us,
            duration_us,
            image,
        })
    }

    fn stop(&mut self) -> Option<String> {
        let mut process = self.process.take()?;
        drop(process.stdin.take());
        if let Err(err) = process.child.kill() {
            debug!("ffmpeg decoder already exited: {err}");
        }
        let _ = process.child.wait();
        if let Some(reader) = process.reader.take() {
            let _ = reader.join();
        }
        process.stderr.take().and_then(|h| h.join().ok())
    }
}

impl VideoDecoder for FfmpegPipeDecoder {
    fn name(&self) -> &'static str {
        "ffmpeg-pipe"
    }

    fn configure(&mut self, config: &DecoderConfig) -> PipelineResult<()> {
        let input = match config.codec {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
            ref other => {
                return Err(PipelineError::codec_unsupported(
                    other.to_string(),
                    "ffmpeg pipe decoder handles H.264 and HEVC",
                ))
            }
        };
        self.reset();
        self.format = Some(StreamFormat {
            input,
            width: config.width,
            height: config.height,
        });
        Ok(())
    }

    fn decode(&mut self, chunk: &EncodedChunk) -> PipelineResult<Vec<DecodedImage>> {
        let process = self.process()?;
        let write = match process.stdin.as_mut() {
            Some(stdin) => stdin
                .write_all(&chunk.payload)
                .and_then(|_| stdin.flush()),
            None => Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
        };
        if let Err(err) = write {
            let stderr = self.stop().unwrap_or_default();
            return Err(PipelineError::decode(format!(
                "ffmpeg rejected chunk {}: {err} {}",
                chunk.decode_index,
                stderr.trim()
            )));
        }
        self.pending
            .push(Reverse((chunk.timestamp_us, chunk.duration_us)));

        let ready: Vec<Vec<u8>> = match &self.process {
            Some(process) => process.frames.try_iter().collect(),
            None => Vec::new(),
        };
        ready.into_iter().map(|pixels| self.wrap(pixels)).collect()
    }

    fn flush(&mut self) -> PipelineResult<Vec<DecodedImage>> {
        let Some(mut process) = self.process.take() else {
            return Ok(Vec::new());
        };
        drop(process.stdin.take());

        let frames: Vec<Vec<u8>> = process.frames.iter().collect();
        let status = process.child.wait()?;
        if let Some(reader) = process.reader.take() {
            let _ = reader.join();
        }
        let stderr = process
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(PipelineError::decode(format!(
                "ffmpeg decoder failed (status {status}): {}",
                stderr.trim()
            )));
        }

        let out = frames
            .into_iter()
            .map(|pixels| self.wrap(pixels))
            .collect::<PipelineResult<Vec<_>>>()?;
        if !self.pending.is_empty() {
            warn!(
                missing = self.pending.len(),
                "ffmpeg produced fewer frames than chunks submitted"
            );
            self.pending.clear();
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.stop();
        self.pending.clear();
        self.last_output = None;
    }
}

impl Drop for FfmpegPipeDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_raw_codec() {
        let mut decoder = FfmpegPipeDecoder::default();
        let config = DecoderConfig {
            codec: VideoCodec::RawRgb24,
            codec_string: "raw ".into(),
            width: 2,
            height: 2,
            extra_data: None,
        };
        assert_eq!(decoder.configure(&config).unwrap_err().kind(), "codec_unsupported");
    }

    #[test]
    fn test_output_takes_smallest_pending_timestamp() {
        let mut decoder = FfmpegPipeDecoder::default();
        decoder.format = Some(StreamFormat {
            input: "h264",
            width: 1,
            height: 1,
        });
        // Decode order I P B: presentation order is 0, 40, 80 as 0, 80, 40.
        for ts in [0, 80_000, 40_000] {
            decoder.pending.push(Reverse((ts, 40_000)));
        }
        let order: Vec<i64> = (0..4)
            .map(|_| decoder.wrap(vec![0; 4]).unwrap().timestamp_us)
            .collect();
        assert_eq!(order, vec![0, 40_000, 80_000, 120_000]);
    }
}
