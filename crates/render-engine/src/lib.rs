//! GrabMe Render Engine
//!
//! Offline export pipeline that turns a recorded video plus editing
//! decisions (trims, viewport, cursor highlight) into an encoded file.
//!
//! # Pipeline Architecture
//!
//! ```text
//! input.mp4 ── FrameSource (fast: demux + decode-ahead | fallback: seek)
//!                   │ DecodedFrame, requested in index order
//!                   ▼
//!             RenderCoordinator ── WorkerPool (N compositor threads)
//!                   │                    │ out of order
//!                   ▼                    ▼
//!             FrameReassembler ◄─────────┘
//!                   │ strictly ascending
//!                   ▼
//!             EncodeQueue ── EncoderSink (ffmpeg | raw mp4 | memory)
//!                                  │
//!                                  ▼
//!                             output.mp4
//! ```

pub mod compositor;
pub mod coordinator;
pub mod encode_queue;
pub mod export;
pub mod reassembler;
pub mod sink;
pub mod source;
pub mod worker_pool;

pub use compositor::Compositor;
pub use coordinator::{CoordinatorStats, RenderCoordinator, RenderMode};
pub use encode_queue::{EncodeQueue, EncodeQueueStats};
pub use export::*;
pub use reassembler::{FrameReassembler, ReassemblerStats};
pub use sink::{
    CollectingSink, EncoderSettings, EncoderSink, FfmpegEncoderSink, OutputFormat, RawMp4Sink,
    SinkSummary,
};
pub use source::{
    open_frame_source, FastFrameSource, FfmpegSeekExtractor, FrameExtractor, FrameSource,
    MediaProbe, OpenedSource, SeekFrameSource, SourceCapabilities, SourceMode, SourceOptions,
    SourceStats,
};
pub use worker_pool::{
    renderer_factory, FrameRenderer, PoolSettings, PoolStats, RenderResult, RenderTask,
    RendererFactory, WorkerPool, WorkerState,
};
