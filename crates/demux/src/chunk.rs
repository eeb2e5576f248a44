//! Encoded chunk, decoder configuration, and container metadata types.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

/// Whether a chunk can be decoded on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Key,
    Delta,
}

/// One compressed unit of video.
///
/// Produced once by the demuxer and consumed once by the decoder; the
/// payload is reference counted so the hand-off never copies it.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Presentation timestamp, normalized so the first frame is at 0.
    pub timestamp_us: i64,
    /// Display duration.
    pub duration_us: i64,
    /// Key or delta.
    pub kind: ChunkKind,
    /// Compressed bytes (Annex-B for AVC/HEVC, packed pixels for raw video).
    pub payload: Bytes,
    /// Position in decode order.
    pub decode_index: u32,
}

impl EncodedChunk {
    pub fn is_key(&self) -> bool {
        self.kind == ChunkKind::Key
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_us as f64 / 1_000.0
    }
}

/// Video codecs the demuxer can describe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum VideoCodec {
    H264,
    Hevc,
    /// Uncompressed packed RGB, 8 bits per channel (`raw `, depth 24).
    RawRgb24,
    /// Uncompressed packed ARGB, 8 bits per channel (`raw `, depth 32).
    RawArgb32,
    /// Any other sample entry, by FourCC.
    Other(String),
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::Hevc => write!(f, "hevc"),
            Self::RawRgb24 => write!(f, "raw-rgb24"),
            Self::RawArgb32 => write!(f, "raw-argb32"),
            Self::Other(fourcc) => write!(f, "{}", fourcc.trim()),
        }
    }
}

/// Everything a decoder needs before the first chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    /// RFC 6381 style codec string where known (e.g. `avc1.64001f`).
    pub codec_string: String,
    pub width: u32,
    pub height: u32,
    /// Raw codec configuration record (`avcC` / `hvcC`), if any.
    #[serde(skip)]
    pub extra_data: Option<Bytes>,
}

/// Capability probe consulted before any chunk is decoded.
pub trait CodecProbe {
    fn supports(&self, config: &DecoderConfig) -> bool;
}

impl<F> CodecProbe for F
where
    F: Fn(&DecoderConfig) -> bool,
{
    fn supports(&self, config: &DecoderConfig) -> bool {
        self(config)
    }
}

/// Metadata returned by [`crate::Demuxer::initialize`].
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub decoder_config: DecoderConfig,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate derived from the dominant sample duration.
    pub fps: f64,
    pub duration_ms: f64,
    pub frame_count: u64,
    pub keyframe_count: u64,
    /// Major brand from `ftyp`, when present.
    pub brand: Option<String>,
}
