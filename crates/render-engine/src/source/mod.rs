//! Frame sources: where the render stage gets decoded frames from.
//!
//! Two implementations sit behind [`FrameSource`]:
//! - [`FastFrameSource`]: demuxer + decoder service + frame buffer with a
//!   decode-ahead task
//! - [`SeekFrameSource`]: one seek-and-extract per frame through a
//!   [`FrameExtractor`] (ffmpeg by default)
//!
//! [`open_frame_source`] tries the fast path and transparently falls back.

mod fallback;
mod fast;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use grabme_common::config::PipelineConfig;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_common::stats::LatencyStats;
use grabme_decode::{
    AccountingSnapshot, DecodedFrame, DecoderRegistry, DecoderStats, FrameAccounting,
    FrameBufferStats,
};
use grabme_project_model::timeline::TimeRemap;

pub use fallback::{FfmpegSeekExtractor, FrameExtractor, MediaProbe, SeekFrameSource};
pub use fast::FastFrameSource;

/// Which path a source serves frames through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Fast,
    Fallback,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// What an initialized source can deliver.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCapabilities {
    pub mode: SourceMode,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Source (untrimmed) duration.
    pub duration_ms: f64,
    pub frame_count: u64,
    pub codec: String,
}

/// Counters reported by every frame source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub mode: Option<SourceMode>,
    pub frames_served: u64,
    /// Frames served by repeating an earlier frame across a gap.
    pub frames_held: u64,
    pub restarts: u64,
    pub decoder_resets: u64,
    pub get_frame_latency: LatencyStats,
    pub buffer: Option<FrameBufferStats>,
    pub decoder: Option<DecoderStats>,
    pub accounting: Option<AccountingSnapshot>,
}

/// Provider of decoded frames for the render stage.
///
/// `get_frame` takes the output frame index plus its effective (trimmed)
/// time; the source maps it to source time itself. The returned frame is
/// owned by the caller.
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync {
    fn mode(&self) -> SourceMode;

    /// Open the input and prepare to serve frames.
    async fn initialize(&mut self) -> PipelineResult<SourceCapabilities>;

    /// The frame shown at `effective_time_ms`.
    async fn get_frame(&self, index: u64, effective_time_ms: f64) -> PipelineResult<DecodedFrame>;

    /// Release every resource. Idempotent.
    fn destroy(&self);

    fn stats(&self) -> SourceStats;
}

/// Everything needed to open either kind of source.
#[derive(Clone)]
pub struct SourceOptions {
    pub pipeline: PipelineConfig,
    pub remap: TimeRemap,
    pub registry: DecoderRegistry,
    pub extractor: Arc<dyn FrameExtractor>,
    pub accounting: FrameAccounting,
}

impl SourceOptions {
    pub fn new(pipeline: PipelineConfig, remap: TimeRemap) -> Self {
        Self {
            pipeline,
            remap,
            registry: DecoderRegistry::with_defaults(),
            extractor: Arc::new(FfmpegSeekExtractor::default()),
            accounting: FrameAccounting::new(),
        }
    }

    pub fn with_registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FrameExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_accounting(mut self, accounting: FrameAccounting) -> Self {
        self.accounting = accounting;
        self
    }
}

/// An initialized source and how it was obtained.
pub struct OpenedSource {
    pub source: Box<dyn FrameSource>,
    pub capabilities: SourceCapabilities,
    /// Why the fast path was skipped, when it was.
    pub fast_path_error: Option<PipelineError>,
}

impl fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedSource")
            .field("capabilities", &self.capabilities)
            .field("fast_path_error", &self.fast_path_error)
            .finish()
    }
}

/// Open `path`, preferring the fast path.
///
/// Any fast-path initialization failure (unparseable container, codec
/// rejected, backend construction error) falls back to seek-based
/// extraction. Only a fallback failure is returned.
pub async fn open_frame_source(path: &Path, options: SourceOptions) -> PipelineResult<OpenedSource> {
    let mut fast = FastFrameSource::new(path, options.clone());
    let fast_error = match fast.initialize().await {
        Ok(capabilities) => {
            info!(
                path = %path.display(),
                codec = %capabilities.codec,
                "Using fast frame source"
            );
            return Ok(OpenedSource {
                source: Box::new(fast),
                capabilities,
                fast_path_error: None,
            });
        }
        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
        Err(err) => err,
    };
    fast.destroy();
    warn!(
        path = %path.display(),
        kind = fast_error.kind(),
        error = %fast_error,
        "Fast frame source unavailable, falling back to seek-based extraction"
    );

    let mut fallback = SeekFrameSource::new(path, options);
    match fallback.initialize().await {
        Ok(capabilities) => Ok(OpenedSource {
            source: Box::new(fallback),
            capabilities,
            fast_path_error: Some(fast_error),
        }),
        Err(err) => {
            error!(
                path = %path.display(),
                fast_error = %fast_error,
                error = %err,
                "Fallback frame source failed too"
            );
            fallback.destroy();
            Err(err)
        }
    }
}
