//! MP4/MOV (ISO BMFF) demuxer.
//!
//! Parses the container once on [`Demuxer::initialize`] and then hands out
//! independent [`ChunkIter`]s over the primary video track. AVC and HEVC
//! payloads are converted to Annex-B with parameter sets on keyframes.

pub mod boxes;
pub mod sample;
pub mod writer;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use grabme_common::clock::{ms_to_us, us_to_ms};
use grabme_common::error::{PipelineError, PipelineResult};

use crate::chunk::{ChunkKind, CodecProbe, ContainerInfo, DecoderConfig, EncodedChunk, VideoCodec};
use crate::nal::{self, ParameterSets};
use boxes::{fourcc_to_string, ParsedMovie, VisualSampleEntry, AVC1, AVC3, HEV1, HVC1, RAW_};
use sample::{SampleEntry, SampleTable};

/// A seekable byte source the demuxer can own.
pub trait ByteSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteSource for T {}

type SharedSource = Arc<Mutex<Option<Box<dyn ByteSource>>>>;

/// Everything derived from the container at initialization.
struct TrackState {
    table: SampleTable,
    codec: VideoCodec,
    parameter_sets: Option<ParameterSets>,
    info: ContainerInfo,
}

/// Demuxer over one container.
pub struct Demuxer {
    label: String,
    source: SharedSource,
    track: Option<Arc<TrackState>>,
}

impl Demuxer {
    /// Open a container file.
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::from_reader(
            BufReader::new(file),
            path.display().to_string(),
        ))
    }

    /// Wrap an already-open byte source. `label` is used in logs.
    pub fn from_reader(reader: impl ByteSource + 'static, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: Arc::new(Mutex::new(Some(Box::new(reader)))),
            track: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_destroyed(&self) -> bool {
        self.source.lock().is_none()
    }

    /// Container metadata, once initialized.
    pub fn info(&self) -> Option<&ContainerInfo> {
        self.track.as_ref().map(|t| &t.info)
    }

    /// Parse the container, accepting any codec.
    pub fn initialize(&mut self) -> PipelineResult<ContainerInfo> {
        self.initialize_with(&|_: &DecoderConfig| true)
    }

    /// Parse the container and check the decoder config against `probe`.
    ///
    /// Calling this again after success returns the cached metadata without
    /// re-probing.
    pub fn initialize_with(&mut self, probe: &dyn CodecProbe) -> PipelineResult<ContainerInfo> {
        if let Some(track) = &self.track {
            return Ok(track.info.clone());
        }

        let (movie, stream_len) = {
            let mut guard = self.source.lock();
            let reader = guard.as_mut().ok_or(PipelineError::Closed {
                component: "demuxer",
            })?;
            let movie = boxes::parse_movie(reader)?;
            let stream_len = reader.seek(SeekFrom::End(0))?;
            (movie, stream_len)
        };

        let state = build_track_state(&movie, stream_len)?;
        if !probe.supports(&state.info.decoder_config) {
            return Err(PipelineError::codec_unsupported(
                state.info.decoder_config.codec_string.clone(),
                "rejected by decoder capability probe",
            ));
        }

        info!(
            source = %self.label,
            codec = %state.codec,
            width = state.info.width,
            height = state.info.height,
            fps = state.info.fps,
            frames = state.info.frame_count,
            keyframes = state.info.keyframe_count,
            "Demuxer initialized"
        );

        let info = state.info.clone();
        self.track = Some(Arc::new(state));
        Ok(info)
    }

    fn track(&self) -> PipelineResult<&Arc<TrackState>> {
        if self.is_destroyed() {
            return Err(PipelineError::Closed {
                component: "demuxer",
            });
        }
        self.track
            .as_ref()
            .ok_or_else(|| PipelineError::config("demuxer used before initialize()"))
    }

    /// Chunks in decode order from the keyframe preceding `start_ms` through
    /// the last chunk presented before `end_ms`.
    pub fn chunks_from(&self, start_ms: f64, end_ms: Option<f64>) -> PipelineResult<ChunkIter> {
        let track = Arc::clone(self.track()?);
        let table = &track.table;

        let range = table
            .sync_at_or_before(ms_to_us(start_ms))
            .and_then(|first| {
                let last = match end_ms {
                    Some(end) => table.last_decode_index_before(ms_to_us(end))?,
                    None => table.len().checked_sub(1)?,
                };
                (last >= first).then_some((first, last))
            });

        let (next, last) = match range {
            Some((first, last)) => (first, last + 1),
            None => (0, 0),
        };
        debug!(
            source = %self.label,
            start_ms,
            end_ms,
            first = next,
            end = last,
            "chunk iterator created"
        );

        Ok(ChunkIter {
            source: Arc::clone(&self.source),
            track,
            next,
            end: last,
        })
    }

    /// Presentation time of the keyframe at or before `timestamp_ms`.
    pub fn seek_to_keyframe(&self, timestamp_ms: f64) -> PipelineResult<f64> {
        let track = self.track()?;
        let index = track
            .table
            .sync_at_or_before(ms_to_us(timestamp_ms))
            .ok_or_else(|| PipelineError::container("video track has no keyframes"))?;
        Ok(us_to_ms(track.table.samples[index].pts_us))
    }

    /// Release the byte source. Safe to call more than once; iterators
    /// created earlier fail with `Closed` on their next item.
    pub fn destroy(&mut self) {
        if self.source.lock().take().is_some() {
            debug!(source = %self.label, "Demuxer destroyed");
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn build_track_state(movie: &ParsedMovie, stream_len: u64) -> PipelineResult<TrackState> {
    let track = movie
        .video_track()
        .ok_or_else(|| PipelineError::container("no video track"))?;
    let entry = track
        .sample_entry
        .as_ref()
        .ok_or_else(|| PipelineError::container("video track has no sample description"))?;

    if track.stsz.sample_count == 0 && movie.fragmented {
        return Err(PipelineError::container(
            "fragmented MP4 without a sample table is not supported",
        ));
    }

    let table = SampleTable::build(track, stream_len)?;
    if table.is_empty() {
        return Err(PipelineError::container("video track has no samples"));
    }

    let (codec, parameter_sets) = describe_codec(entry);
    let width = if entry.width > 0 {
        entry.width as u32
    } else {
        track.width
    };
    let height = if entry.height > 0 {
        entry.height as u32
    } else {
        track.height
    };

    let codec_string = parameter_sets
        .as_ref()
        .and_then(|p| p.codec_string.clone())
        .unwrap_or_else(|| match &codec {
            VideoCodec::H264 | VideoCodec::Hevc => fourcc_to_string(entry.fourcc),
            other => other.to_string(),
        });

    let mut duration_us = table.duration_us();
    if duration_us == 0 && track.timescale > 0 {
        duration_us = sample::ticks_to_us(track.duration as i64, track.timescale);
    }

    let info = ContainerInfo {
        decoder_config: DecoderConfig {
            codec: codec.clone(),
            codec_string,
            width,
            height,
            extra_data: entry.config_record.clone().map(Bytes::from),
        },
        width,
        height,
        fps: table.fps(),
        duration_ms: us_to_ms(duration_us),
        frame_count: table.len() as u64,
        keyframe_count: table.keyframe_count() as u64,
        brand: movie.major_brand.map(fourcc_to_string),
    };

    Ok(TrackState {
        table,
        codec,
        parameter_sets,
        info,
    })
}

fn describe_codec(entry: &VisualSampleEntry) -> (VideoCodec, Option<ParameterSets>) {
    let record = entry.config_record.as_deref();
    match entry.fourcc {
        AVC1 | AVC3 => (VideoCodec::H264, record.and_then(nal::parse_avcc)),
        HVC1 | HEV1 => (VideoCodec::Hevc, record.and_then(nal::parse_hvcc)),
        RAW_ => match entry.depth {
            24 => (VideoCodec::RawRgb24, None),
            32 => (VideoCodec::RawArgb32, None),
            _ => (VideoCodec::Other(fourcc_to_string(RAW_)), None),
        },
        other => (VideoCodec::Other(fourcc_to_string(other)), None),
    }
}

/// Forward-only iterator over a range of chunks.
///
/// Holds its own handle on the byte source, so it can be moved to a
/// decode-ahead thread independently of the [`Demuxer`].
pub struct ChunkIter {
    source: SharedSource,
    track: Arc<TrackState>,
    next: usize,
    end: usize,
}

impl ChunkIter {
    /// Chunks left to yield.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.next)
    }

    fn read_chunk(&self, entry: &SampleEntry) -> PipelineResult<EncodedChunk> {
        let mut data = vec![0u8; entry.size as usize];
        {
            let mut guard = self.source.lock();
            let reader = guard.as_mut().ok_or(PipelineError::Closed {
                component: "demuxer",
            })?;
            reader.seek(SeekFrom::Start(entry.offset))?;
            reader.read_exact(&mut data).map_err(boxes::truncated)?;
        }

        let payload = match (&self.track.codec, &self.track.parameter_sets) {
            (VideoCodec::H264 | VideoCodec::Hevc, sets) => {
                let length_size = sets.as_ref().map_or(4, |s| s.length_size);
                let annexb = nal::length_prefixed_to_annexb(&data, length_size);
                match sets {
                    Some(sets) if entry.is_sync && !sets.units.is_empty() => {
                        nal::prepend_parameter_sets(&sets.units, &annexb)
                    }
                    _ => annexb,
                }
            }
            _ => data,
        };

        Ok(EncodedChunk {
            timestamp_us: entry.pts_us,
            duration_us: entry.duration_us,
            kind: if entry.is_sync {
                ChunkKind::Key
            } else {
                ChunkKind::Delta
            },
            payload: Bytes::from(payload),
            decode_index: entry.index,
        })
    }
}

impl Iterator for ChunkIter {
    type Item = PipelineResult<EncodedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let entry = self.track.table.samples[self.next].clone();
        let result = self.read_chunk(&entry);
        // Errors end the iteration.
        self.next = if result.is_ok() {
            self.next + 1
        } else {
            self.end
        };
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}
