//! Decoder for uncompressed `raw ` video (RGB24 / ARGB32).

use grabme_common::error::{PipelineError, PipelineResult};
use grabme_demux::{DecoderConfig, EncodedChunk, VideoCodec};

use crate::backend::{DecodedImage, DecoderBackend, VideoDecoder};
use crate::frame::RgbaImage;

/// Backend for packed RGB and ARGB samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVideoBackend;

impl DecoderBackend for RawVideoBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn supports(&self, config: &DecoderConfig) -> bool {
        matches!(config.codec, VideoCodec::RawRgb24 | VideoCodec::RawArgb32)
            && config.width > 0
            && config.height > 0
    }

    fn create(&self) -> PipelineResult<Box<dyn VideoDecoder>> {
        Ok(Box::new(RawVideoDecoder::default()))
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Rgb24,
    Argb32,
}

/// Converts each chunk to one RGBA picture. Stateless between chunks.
#[derive(Debug, Default)]
pub struct RawVideoDecoder {
    format: Option<(Layout, u32, u32)>,
}

impl VideoDecoder for RawVideoDecoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn configure(&mut self, config: &DecoderConfig) -> PipelineResult<()> {
        let layout = match config.codec {
            VideoCodec::RawRgb24 => Layout::Rgb24,
            VideoCodec::RawArgb32 => Layout::Argb32,
            ref other => {
                return Err(PipelineError::codec_unsupported(
                    other.to_string(),
                    "raw decoder only handles RGB24/ARGB32",
                ))
            }
        };
        self.format = Some((layout, config.width, config.height));
        Ok(())
    }

    fn decode(&mut self, chunk: &EncodedChunk) -> PipelineResult<Vec<DecodedImage>> {
        let (layout, width, height) = self
            .format
            .ok_or_else(|| PipelineError::decode("raw decoder is not configured"))?;
        let pixels = width as usize * height as usize;
        let src = chunk.payload.as_ref();

        let rgba = match layout {
            Layout::Rgb24 => {
                if src.len() != pixels * 3 {
                    return Err(PipelineError::decode(format!(
                        "raw RGB24 sample {} has {} bytes, expected {}",
                        chunk.decode_index,
                        src.len(),
                        pixels * 3
                    )));
                }
                let mut out = Vec::with_capacity(pixels * 4);
                for px in src.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                out
            }
            Layout::Argb32 => {
                if src.len() != pixels * 4 {
                    return Err(PipelineError::decode(format!(
                        "raw ARGB32 sample {} has {} bytes, expected {}",
                        chunk.decode_index,
                        src.len(),
                        pixels * 4
                    )));
                }
                let mut out = Vec::with_capacity(pixels * 4);
                for px in src.chunks_exact(4) {
                    out.extend_from_slice(&[px[1], px[2], px[3], px[0]]);
                }
                out
            }
        };

        Ok(vec![DecodedImage {
            timestamp_us: chunk.timestamp_us,
            duration_us: chunk.duration_us,
            image: RgbaImage::new(width, height, rgba)?,
        }])
    }

    fn flush(&mut self) -> PipelineResult<Vec<DecodedImage>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        self.format = None;
    }
}
