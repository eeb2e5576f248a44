//! Decoder backend trait and registry.

use std::sync::Arc;

use tracing::debug;

use grabme_common::error::{PipelineError, PipelineResult};
use grabme_demux::{CodecProbe, DecoderConfig, EncodedChunk};

use crate::frame::RgbaImage;

/// A decoded picture before it is wrapped in a tracked frame.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub image: RgbaImage,
}

/// A configured decoder instance. Runs on the decode thread only.
pub trait VideoDecoder: Send {
    fn name(&self) -> &'static str;

    /// Prepare for a stream described by `config`.
    fn configure(&mut self, config: &DecoderConfig) -> PipelineResult<()>;

    /// Feed one chunk; return any pictures that became ready.
    fn decode(&mut self, chunk: &EncodedChunk) -> PipelineResult<Vec<DecodedImage>>;

    /// Emit every picture still held by the decoder.
    fn flush(&mut self) -> PipelineResult<Vec<DecodedImage>>;

    /// Drop internal state. The decoder must be configured again.
    fn reset(&mut self);
}

/// Factory for one family of decoders.
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capability probe: can this backend decode `config`?
    fn supports(&self, config: &DecoderConfig) -> bool;

    fn create(&self) -> PipelineResult<Box<dyn VideoDecoder>>;
}

/// Ordered list of backends; the first one that supports a config wins.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    backends: Vec<Arc<dyn DecoderBackend>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw video first, then the ffmpeg pipe decoder.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::raw::RawVideoBackend));
        registry.register(Arc::new(crate::ffmpeg::FfmpegPipeBackend::default()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn DecoderBackend>) {
        self.backends.push(backend);
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn select(&self, config: &DecoderConfig) -> Option<Arc<dyn DecoderBackend>> {
        self.backends
            .iter()
            .find(|b| b.supports(config))
            .map(Arc::clone)
    }

    /// Build a decoder for `config`, or fail with `CodecUnsupported`.
    pub fn create(&self, config: &DecoderConfig) -> PipelineResult<Box<dyn VideoDecoder>> {
        let backend = self.select(config).ok_or_else(|| {
            PipelineError::codec_unsupported(
                config.codec_string.clone(),
                format!("no decoder backend among {:?}", self.backend_names()),
            )
        })?;
        debug!(backend = backend.name(), codec = %config.codec, "decoder backend selected");
        backend.create()
    }
}

impl CodecProbe for DecoderRegistry {
    fn supports(&self, config: &DecoderConfig) -> bool {
        self.select(config).is_some()
    }
}
