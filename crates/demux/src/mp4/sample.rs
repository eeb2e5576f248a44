//! Flat sample index built from the parsed `stbl` boxes.
//!
//! Timestamps are converted to microseconds and shifted so the first
//! presented sample is at zero.

use std::collections::HashSet;

use tracing::debug;

use grabme_common::error::{PipelineError, PipelineResult};

use crate::mp4::boxes::{CttsEntry, ParsedTrack, StscEntry, SttsEntry};

/// One sample in decode order.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleEntry {
    /// 0-based decode index.
    pub index: u32,
    /// Byte offset in the file.
    pub offset: u64,
    pub size: u32,
    /// Decode timestamp (µs, shifted by the same amount as `pts_us`).
    pub dts_us: i64,
    /// Presentation timestamp (µs, first presented sample at 0).
    pub pts_us: i64,
    pub duration_us: i64,
    pub is_sync: bool,
}

/// Decode-ordered samples of the video track.
#[derive(Clone, Debug, Default)]
pub struct SampleTable {
    pub samples: Vec<SampleEntry>,
    pub timescale: u32,
    /// Most common `stts` delta, in timescale units.
    pub dominant_delta: u32,
}

impl SampleTable {
    /// Every sample must lie inside the first `stream_len` bytes.
    pub fn build(track: &ParsedTrack, stream_len: u64) -> PipelineResult<Self> {
        if track.timescale == 0 {
            return Err(PipelineError::container("video track has a zero timescale"));
        }
        let sample_count = track.stsz.sample_count as usize;
        if sample_count == 0 {
            return Ok(Self {
                samples: Vec::new(),
                timescale: track.timescale,
                dominant_delta: 0,
            });
        }

        let default_size = track.stsz.default_sample_size as u64;
        if default_size > 0 && (sample_count as u64).saturating_mul(default_size) > stream_len {
            return Err(PipelineError::container(format!(
                "stsz declares {sample_count} samples of {default_size} bytes in a {stream_len} byte stream"
            )));
        }

        let placement = build_sample_offsets(
            &track.stsc,
            &track.chunk_offsets,
            &track.stsz.sample_sizes,
            track.stsz.default_sample_size,
            sample_count,
        )?;
        if let Some((i, &(offset, size))) = placement
            .iter()
            .enumerate()
            .find(|(_, &(offset, size))| offset.saturating_add(size as u64) > stream_len)
        {
            return Err(PipelineError::container(format!(
                "sample {i} ({size} bytes at offset {offset}) runs past the {stream_len} byte stream"
            )));
        }
        let (dts, deltas) = build_dts_array(&track.stts, sample_count)?;
        let cts_offsets = build_cts_offsets(&track.ctts, sample_count);
        let sync: Option<HashSet<u32>> = track
            .sync_samples
            .as_ref()
            .map(|list| list.iter().copied().collect());

        let presented: Vec<i64> = dts
            .iter()
            .zip(&cts_offsets)
            .map(|(&d, &c)| d as i64 + c as i64)
            .collect();
        let base = presented.iter().copied().min().unwrap_or(0);

        let timescale = track.timescale;
        let samples = (0..sample_count)
            .map(|i| {
                let (offset, size) = placement[i];
                SampleEntry {
                    index: i as u32,
                    offset,
                    size,
                    dts_us: ticks_to_us(dts[i] as i64 - base, timescale),
                    pts_us: ticks_to_us(presented[i] - base, timescale),
                    duration_us: ticks_to_us(deltas[i] as i64, timescale),
                    is_sync: sync
                        .as_ref()
                        .map_or(true, |set| set.contains(&(i as u32 + 1))),
                }
            })
            .collect::<Vec<_>>();

        let table = Self {
            samples,
            timescale,
            dominant_delta: dominant_delta(&track.stts),
        };
        debug!(
            "SampleTable: {} samples, {} keyframes, timescale={}",
            table.samples.len(),
            table.keyframe_count(),
            timescale
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn keyframe_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_sync).count()
    }

    /// Nominal frame rate from the dominant sample delta.
    pub fn fps(&self) -> f64 {
        if self.dominant_delta == 0 {
            return 0.0;
        }
        self.timescale as f64 / self.dominant_delta as f64
    }

    /// Presentation end of the last frame, in microseconds.
    pub fn duration_us(&self) -> i64 {
        self.samples
            .iter()
            .map(|s| s.pts_us + s.duration_us)
            .max()
            .unwrap_or(0)
    }

    /// Decode index of the last sync sample presented at or before `pts_us`.
    ///
    /// Falls back to the first sync sample when the target precedes every
    /// keyframe.
    pub fn sync_at_or_before(&self, pts_us: i64) -> Option<usize> {
        let mut best: Option<(usize, i64)> = None;
        let mut first: Option<usize> = None;
        for sample in self.samples.iter().filter(|s| s.is_sync) {
            first.get_or_insert(sample.index as usize);
            if sample.pts_us <= pts_us && best.map_or(true, |(_, pts)| sample.pts_us >= pts) {
                best = Some((sample.index as usize, sample.pts_us));
            }
        }
        best.map(|(index, _)| index).or(first)
    }

    /// Highest decode index whose presentation time is before `end_us`.
    ///
    /// Decoding must run through this index so every frame presented
    /// before the end is produced, even with B-frame reordering.
    pub fn last_decode_index_before(&self, end_us: i64) -> Option<usize> {
        self.samples
            .iter()
            .filter(|s| s.pts_us < end_us)
            .map(|s| s.index as usize)
            .max()
    }
}

/// Convert media ticks to microseconds without intermediate overflow.
pub fn ticks_to_us(ticks: i64, timescale: u32) -> i64 {
    (ticks as i128 * 1_000_000 / timescale as i128) as i64
}

fn dominant_delta(stts: &[SttsEntry]) -> u32 {
    stts.iter()
        .filter(|e| e.sample_delta > 0)
        .max_by_key(|e| e.sample_count)
        .map_or(0, |e| e.sample_delta)
}

/// Resolve each sample's file offset and size from stsc + stco + stsz.
fn build_sample_offsets(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sample_sizes: &[u32],
    default_size: u32,
    sample_count: usize,
) -> PipelineResult<Vec<(u64, u32)>> {
    if stsc.is_empty() || chunk_offsets.is_empty() {
        return Err(PipelineError::container(
            "sample table is missing stsc or chunk offsets",
        ));
    }
    if default_size == 0 && sample_sizes.len() < sample_count {
        return Err(PipelineError::container(format!(
            "stsz lists {} sizes for {} samples",
            sample_sizes.len(),
            sample_count
        )));
    }

    let mut result = Vec::with_capacity(sample_count);
    let mut stsc_idx = 0;

    for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_idx as u32 + 1;
        while stsc_idx + 1 < stsc.len() && stsc[stsc_idx + 1].first_chunk <= chunk_number {
            stsc_idx += 1;
        }

        let mut offset = chunk_offset;
        for _ in 0..stsc[stsc_idx].samples_per_chunk {
            let sample = result.len();
            if sample >= sample_count {
                return Ok(result);
            }
            let size = if default_size > 0 {
                default_size
            } else {
                sample_sizes[sample]
            };
            result.push((offset, size));
            offset = offset.saturating_add(size as u64);
        }
    }

    if result.len() < sample_count {
        return Err(PipelineError::container(format!(
            "chunk map covers {} of {} samples",
            result.len(),
            sample_count
        )));
    }
    Ok(result)
}

/// Expand stts into per-sample decode times and deltas.
fn build_dts_array(stts: &[SttsEntry], sample_count: usize) -> PipelineResult<(Vec<u64>, Vec<u32>)> {
    let mut dts = Vec::with_capacity(sample_count);
    let mut deltas = Vec::with_capacity(sample_count);
    let mut current = 0u64;

    'outer: for entry in stts {
        for _ in 0..entry.sample_count {
            if dts.len() >= sample_count {
                break 'outer;
            }
            dts.push(current);
            deltas.push(entry.sample_delta);
            current += entry.sample_delta as u64;
        }
    }

    if dts.len() < sample_count {
        return Err(PipelineError::container(format!(
            "stts covers {} of {} samples",
            dts.len(),
            sample_count
        )));
    }
    Ok((dts, deltas))
}

/// Expand ctts into per-sample composition offsets. Missing entries are 0.
fn build_cts_offsets(ctts: &[CttsEntry], sample_count: usize) -> Vec<i32> {
    let mut offsets: Vec<i32> = ctts
        .iter()
        .flat_map(|e| std::iter::repeat(e.sample_offset).take(e.sample_count as usize))
        .take(sample_count)
        .collect();
    offsets.resize(sample_count, 0);
    offsets
}
