//! GrabMe Demuxer
//!
//! Reads a recorded container and yields the pieces the decoder needs:
//! a [`DecoderConfig`], container metadata, and a lazy, restartable
//! sequence of [`EncodedChunk`]s in decode order.
//!
//! Only ISO-BMFF (MP4/MOV) is parsed here. Anything else surfaces as a
//! `Container` error so the caller can move to the seek-based fallback.

pub mod chunk;
pub mod mp4;
pub mod nal;

pub use chunk::*;
pub use mp4::writer::RawMp4Writer;
pub use mp4::{ChunkIter, Demuxer};
