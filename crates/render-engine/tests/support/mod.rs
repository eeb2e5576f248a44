//! Shared fixtures: synthetic raw MP4 recordings and a scripted extractor.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use grabme_common::error::PipelineResult;
use grabme_decode::RgbaImage;
use grabme_demux::RawMp4Writer;
use grabme_render_engine::{FrameExtractor, MediaProbe};

/// Red channel encoding frame `index`.
pub fn shade(index: u32) -> u8 {
    (index * 8).min(255) as u8
}

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("grabme_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write `frames` solid frames whose red channel is [`shade`] of the index.
pub fn write_recording(path: &Path, frames: u32, fps: u32, width: u32, height: u32) {
    let mut writer = RawMp4Writer::create(path, width, height, fps).unwrap();
    for index in 0..frames {
        let rgb: Vec<u8> = (0..width * height)
            .flat_map(|_| [shade(index), 0, 0])
            .collect();
        writer.write_frame(&rgb).unwrap();
    }
    writer.finish().unwrap();
}

/// Extractor that paints the frame index of `time_ms` into the red channel.
pub struct ScriptedExtractor {
    pub fps: f64,
    pub frame_count: u64,
    pub calls: AtomicU64,
}

impl ScriptedExtractor {
    pub fn new(fps: f64, frame_count: u64) -> Self {
        Self {
            fps,
            frame_count,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl FrameExtractor for ScriptedExtractor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, _path: &Path) -> PipelineResult<MediaProbe> {
        Ok(MediaProbe {
            width: 8,
            height: 8,
            fps: self.fps,
            duration_ms: self.frame_count as f64 * 1_000.0 / self.fps,
            frame_count: self.frame_count,
            codec: "scripted".to_string(),
        })
    }

    async fn extract(
        &self,
        _path: &Path,
        time_ms: f64,
        width: u32,
        height: u32,
    ) -> PipelineResult<Option<RgbaImage>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let index = (time_ms * self.fps / 1_000.0).round() as u32;
        if index as u64 >= self.frame_count {
            return Ok(None);
        }
        RgbaImage::filled(width, height, [shade(index), 0, 0, 255]).map(Some)
    }
}
