//! GrabMe Decode
//!
//! Turns encoded chunks into owned RGBA frames:
//! - [`DecodedFrame`]: move-only frame handle with leak accounting
//! - [`VideoDecoder`] backends (raw video, ffmpeg pipe) and [`DecoderRegistry`]
//! - [`DecoderService`]: bounded decode queue on a dedicated thread
//! - [`FrameBuffer`]: bounded timestamp-keyed store for decoded frames

pub mod backend;
pub mod ffmpeg;
pub mod frame;
pub mod frame_buffer;
pub mod raw;
pub mod service;

pub use backend::{DecodedImage, DecoderBackend, DecoderRegistry, VideoDecoder};
pub use ffmpeg::{command_exists, FfmpegPipeBackend, FfmpegPipeDecoder};
pub use frame::{AccountingSnapshot, DecodedFrame, FrameAccounting, RgbaImage};
pub use frame_buffer::{FrameBuffer, FrameBufferStats, FrameInfo};
pub use raw::{RawVideoBackend, RawVideoDecoder};
pub use service::{
    DecoderService, DecoderSettings, DecoderState, DecoderStats, ErrorCallback, FrameCallback,
};
