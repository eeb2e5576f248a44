//! ISO BMFF box parsing for the parts of the tree a video export needs.
//!
//! Reference: ISO/IEC 14496-12. Only the primary video track's sample
//! description and sample table are kept; everything else is skipped.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::{debug, trace};

use grabme_common::error::{PipelineError, PipelineResult};

// ─── FourCC constants ───────────────────────────────────────────────

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | code[3] as u32
}

pub const FTYP: u32 = fourcc(b"ftyp");
pub const MOOV: u32 = fourcc(b"moov");
pub const MVHD: u32 = fourcc(b"mvhd");
pub const TRAK: u32 = fourcc(b"trak");
pub const TKHD: u32 = fourcc(b"tkhd");
pub const MDIA: u32 = fourcc(b"mdia");
pub const MDHD: u32 = fourcc(b"mdhd");
pub const HDLR: u32 = fourcc(b"hdlr");
pub const MINF: u32 = fourcc(b"minf");
pub const STBL: u32 = fourcc(b"stbl");
pub const STSD: u32 = fourcc(b"stsd");
pub const STTS: u32 = fourcc(b"stts");
pub const CTTS: u32 = fourcc(b"ctts");
pub const STSC: u32 = fourcc(b"stsc");
pub const STSZ: u32 = fourcc(b"stsz");
pub const STCO: u32 = fourcc(b"stco");
pub const CO64: u32 = fourcc(b"co64");
pub const STSS: u32 = fourcc(b"stss");
pub const MDAT: u32 = fourcc(b"mdat");
pub const MOOF: u32 = fourcc(b"moof");
pub const VMHD: u32 = fourcc(b"vmhd");
pub const DINF: u32 = fourcc(b"dinf");
pub const DREF: u32 = fourcc(b"dref");
pub const URL_: u32 = fourcc(b"url ");
pub const VIDE: u32 = fourcc(b"vide");
pub const AVC1: u32 = fourcc(b"avc1");
pub const AVC3: u32 = fourcc(b"avc3");
pub const HVC1: u32 = fourcc(b"hvc1");
pub const HEV1: u32 = fourcc(b"hev1");
pub const AVCC: u32 = fourcc(b"avcC");
pub const HVCC: u32 = fourcc(b"hvcC");
pub const RAW_: u32 = fourcc(b"raw ");

/// Printable form of a FourCC for logs and errors.
pub fn fourcc_to_string(cc: u32) -> String {
    cc.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

fn is_printable_fourcc(cc: u32) -> bool {
    cc.to_be_bytes()
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b' ' || b == b'-' || b == b'_' || b == 0xA9)
}

pub(crate) fn truncated(err: std::io::Error) -> PipelineError {
    PipelineError::container(format!("truncated container data: {err}"))
}

fn malformed(offset: u64, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::container(format!("malformed box at offset {offset}: {reason}"))
}

// ─── Box Header ─────────────────────────────────────────────────────

/// A parsed box header with its extent resolved.
#[derive(Clone, Debug)]
pub struct BoxHeader {
    /// FourCC type code.
    pub box_type: u32,
    /// Offset of the box start.
    pub offset: u64,
    /// Size of the header itself (8 or 16 bytes).
    pub header_size: u8,
    /// Offset of the first byte after this box. A size-0 box extends to
    /// the end of the stream and has this resolved at read time.
    pub end: u64,
}

impl BoxHeader {
    /// Byte offset where the box payload starts.
    pub fn content_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    /// Payload size in bytes.
    pub fn content_size(&self) -> u64 {
        self.end.saturating_sub(self.content_offset())
    }
}

/// Read a box header at the current position. Returns `None` at a clean EOF.
pub fn read_box_header<R: Read + Seek>(reader: &mut R) -> PipelineResult<Option<BoxHeader>> {
    let offset = reader.stream_position()?;

    let size32 = match reader.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let box_type = reader.read_u32::<BigEndian>().map_err(truncated)?;

    if !is_printable_fourcc(box_type) {
        return Err(malformed(
            offset,
            format!("'{}' is not a box type", fourcc_to_string(box_type)),
        ));
    }

    let (end, header_size) = match size32 {
        0 => {
            let end = reader.seek(SeekFrom::End(0))?;
            reader.seek(SeekFrom::Start(offset + 8))?;
            (end, 8u8)
        }
        1 => {
            let size64 = reader.read_u64::<BigEndian>().map_err(truncated)?;
            if size64 < 16 {
                return Err(malformed(offset, format!("largesize {size64} below header")));
            }
            (offset + size64, 16u8)
        }
        n if n < 8 => {
            return Err(malformed(offset, format!("size {n} below header")));
        }
        n => (offset + n as u64, 8u8),
    };

    trace!(
        "Box '{}' at offset {}, end {}",
        fourcc_to_string(box_type),
        offset,
        end
    );

    Ok(Some(BoxHeader {
        box_type,
        offset,
        header_size,
        end,
    }))
}

/// Seek past the box.
pub fn skip_box<R: Seek>(reader: &mut R, header: &BoxHeader) -> PipelineResult<()> {
    reader.seek(SeekFrom::Start(header.end))?;
    Ok(())
}

/// Visit each child box of `parent`, starting `skip` bytes into its payload.
///
/// The reader is repositioned at each child's end after the visitor
/// returns, so visitors may stop reading early.
fn for_each_child<R, F>(
    reader: &mut R,
    parent: &BoxHeader,
    skip: u64,
    mut visit: F,
) -> PipelineResult<()>
where
    R: Read + Seek,
    F: FnMut(&mut R, &BoxHeader) -> PipelineResult<()>,
{
    let mut pos = parent.content_offset() + skip;
    reader.seek(SeekFrom::Start(pos))?;
    while pos + 8 <= parent.end {
        let child = read_box_header(reader)?
            .ok_or_else(|| malformed(pos, "unexpected end inside container box"))?;
        if child.end > parent.end {
            return Err(malformed(
                child.offset,
                format!(
                    "'{}' overruns its parent '{}'",
                    fourcc_to_string(child.box_type),
                    fourcc_to_string(parent.box_type)
                ),
            ));
        }
        visit(reader, &child)?;
        skip_box(reader, &child)?;
        pos = child.end;
    }
    Ok(())
}

fn read_version_flags<R: Read>(reader: &mut R) -> PipelineResult<(u8, u32)> {
    let word = reader.read_u32::<BigEndian>().map_err(truncated)?;
    Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
}

// ─── Parsed Structures ──────────────────────────────────────────────

/// Visual sample entry from `stsd`.
#[derive(Clone, Debug, Default)]
pub struct VisualSampleEntry {
    pub fourcc: u32,
    pub width: u16,
    pub height: u16,
    /// Bits per pixel (meaningful for uncompressed video).
    pub depth: u16,
    /// `avcC` / `hvcC` record bytes.
    pub config_record: Option<Vec<u8>>,
}

/// stts (Decoding Time to Sample) entry.
#[derive(Clone, Debug)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// ctts (Composition Time to Sample) entry.
#[derive(Clone, Debug)]
pub struct CttsEntry {
    pub sample_count: u32,
    /// Composition offset (signed in version 1).
    pub sample_offset: i32,
}

/// stsc (Sample to Chunk) entry.
#[derive(Clone, Debug)]
pub struct StscEntry {
    /// First chunk number (1-based).
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// Parsed stsz (Sample Size) box.
#[derive(Clone, Debug, Default)]
pub struct StszBox {
    /// If non-zero, all samples have this uniform size.
    pub default_sample_size: u32,
    /// Individual sample sizes (empty if `default_sample_size > 0`).
    pub sample_sizes: Vec<u32>,
    pub sample_count: u32,
}

/// One track's worth of parsed boxes.
#[derive(Clone, Debug, Default)]
pub struct ParsedTrack {
    pub track_id: u32,
    pub handler: u32,
    /// Presentation size from `tkhd` (integer part of 16.16).
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub duration: u64,
    pub sample_entry: Option<VisualSampleEntry>,
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    pub stsz: StszBox,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers; `None` means every sample is sync.
    pub sync_samples: Option<Vec<u32>>,
}

impl ParsedTrack {
    pub fn is_video(&self) -> bool {
        self.handler == VIDE
    }
}

/// The parts of the file the demuxer keeps.
#[derive(Clone, Debug, Default)]
pub struct ParsedMovie {
    pub major_brand: Option<u32>,
    pub timescale: u32,
    pub duration: u64,
    pub tracks: Vec<ParsedTrack>,
    pub fragmented: bool,
}

impl ParsedMovie {
    /// First track with a `vide` handler.
    pub fn video_track(&self) -> Option<&ParsedTrack> {
        self.tracks.iter().find(|t| t.is_video())
    }
}

// ─── Top Level ──────────────────────────────────────────────────────

/// Scan top-level boxes and parse `ftyp` and `moov`.
pub fn parse_movie<R: Read + Seek>(reader: &mut R) -> PipelineResult<ParsedMovie> {
    reader.seek(SeekFrom::Start(0))?;
    let mut movie = ParsedMovie::default();
    let mut saw_moov = false;
    let mut first = true;

    while let Some(header) = read_box_header(reader).map_err(|e| {
        if first {
            PipelineError::container(format!("not an ISO-BMFF container ({e})"))
        } else {
            e
        }
    })? {
        first = false;
        match header.box_type {
            FTYP => {
                movie.major_brand = Some(reader.read_u32::<BigEndian>().map_err(truncated)?);
            }
            MOOV => {
                parse_moov(reader, &header, &mut movie)?;
                saw_moov = true;
            }
            MOOF => movie.fragmented = true,
            other => debug!("skipping top-level box '{}'", fourcc_to_string(other)),
        }
        skip_box(reader, &header)?;
    }

    if first {
        return Err(PipelineError::container("empty container"));
    }
    if !saw_moov {
        return Err(PipelineError::container("no 'moov' box found"));
    }
    Ok(movie)
}

fn parse_moov<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
    movie: &mut ParsedMovie,
) -> PipelineResult<()> {
    for_each_child(reader, header, 0, |reader, child| {
        match child.box_type {
            MVHD => {
                let (version, _) = read_version_flags(reader)?;
                let (timescale, duration) = read_times(reader, version)?;
                movie.timescale = timescale;
                movie.duration = duration;
            }
            TRAK => movie.tracks.push(parse_trak(reader, child)?),
            _ => {}
        }
        Ok(())
    })
}

/// Read the creation/modification/timescale/duration block shared by
/// `mvhd` and `mdhd`.
fn read_times<R: Read>(reader: &mut R, version: u8) -> PipelineResult<(u32, u64)> {
    if version == 1 {
        reader.read_u64::<BigEndian>().map_err(truncated)?;
        reader.read_u64::<BigEndian>().map_err(truncated)?;
        let timescale = reader.read_u32::<BigEndian>().map_err(truncated)?;
        let duration = reader.read_u64::<BigEndian>().map_err(truncated)?;
        Ok((timescale, duration))
    } else {
        reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u32::<BigEndian>().map_err(truncated)?;
        let timescale = reader.read_u32::<BigEndian>().map_err(truncated)?;
        let duration = reader.read_u32::<BigEndian>().map_err(truncated)? as u64;
        Ok((timescale, duration))
    }
}

fn parse_trak<R: Read + Seek>(reader: &mut R, header: &BoxHeader) -> PipelineResult<ParsedTrack> {
    let mut track = ParsedTrack::default();
    for_each_child(reader, header, 0, |reader, child| {
        match child.box_type {
            TKHD => parse_tkhd(reader, &mut track)?,
            MDIA => parse_mdia(reader, child, &mut track)?,
            _ => {}
        }
        Ok(())
    })?;
    debug!(
        track_id = track.track_id,
        handler = %fourcc_to_string(track.handler),
        samples = track.stsz.sample_count,
        "parsed trak"
    );
    Ok(track)
}

fn parse_tkhd<R: Read>(reader: &mut R, track: &mut ParsedTrack) -> PipelineResult<()> {
    let (version, _) = read_version_flags(reader)?;
    if version == 1 {
        reader.read_u64::<BigEndian>().map_err(truncated)?;
        reader.read_u64::<BigEndian>().map_err(truncated)?;
        track.track_id = reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u64::<BigEndian>().map_err(truncated)?;
    } else {
        reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u32::<BigEndian>().map_err(truncated)?;
        track.track_id = reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u32::<BigEndian>().map_err(truncated)?;
    }
    // reserved(8) layer(2) alternate_group(2) volume(2) reserved(2) matrix(36)
    let mut skip = [0u8; 52];
    reader.read_exact(&mut skip).map_err(truncated)?;
    track.width = reader.read_u32::<BigEndian>().map_err(truncated)? >> 16;
    track.height = reader.read_u32::<BigEndian>().map_err(truncated)? >> 16;
    Ok(())
}

fn parse_mdia<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
    track: &mut ParsedTrack,
) -> PipelineResult<()> {
    for_each_child(reader, header, 0, |reader, child| {
        match child.box_type {
            MDHD => {
                let (version, _) = read_version_flags(reader)?;
                let (timescale, duration) = read_times(reader, version)?;
                track.timescale = timescale;
                track.duration = duration;
            }
            HDLR => {
                read_version_flags(reader)?;
                reader.read_u32::<BigEndian>().map_err(truncated)?; // pre_defined
                track.handler = reader.read_u32::<BigEndian>().map_err(truncated)?;
            }
            MINF => for_each_child(reader, child, 0, |reader, grandchild| {
                if grandchild.box_type == STBL {
                    parse_stbl(reader, grandchild, track)?;
                }
                Ok(())
            })?,
            _ => {}
        }
        Ok(())
    })
}

fn parse_stbl<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
    track: &mut ParsedTrack,
) -> PipelineResult<()> {
    for_each_child(reader, header, 0, |reader, child| {
        match child.box_type {
            STSD => track.sample_entry = parse_stsd(reader, child)?,
            STTS => track.stts = parse_stts(reader)?,
            CTTS => track.ctts = parse_ctts(reader)?,
            STSC => track.stsc = parse_stsc(reader)?,
            STSZ => track.stsz = parse_stsz(reader)?,
            STCO => track.chunk_offsets = parse_stco(reader)?,
            CO64 => track.chunk_offsets = parse_co64(reader)?,
            STSS => track.sync_samples = Some(parse_stss(reader)?),
            _ => {}
        }
        Ok(())
    })
}

// ─── stsd Box ───────────────────────────────────────────────────────

/// Size of the fixed VisualSampleEntry fields after the box header.
const VISUAL_SAMPLE_ENTRY_FIELDS: u64 = 78;

/// Parse `stsd` and return its first visual sample entry.
fn parse_stsd<R: Read + Seek>(
    reader: &mut R,
    header: &BoxHeader,
) -> PipelineResult<Option<VisualSampleEntry>> {
    read_version_flags(reader)?;
    let entry_count = reader.read_u32::<BigEndian>().map_err(truncated)?;
    if entry_count == 0 {
        return Ok(None);
    }

    let entry = read_box_header(reader)?
        .ok_or_else(|| malformed(header.offset, "stsd declares entries but has none"))?;
    if entry.end > header.end || entry.content_size() < VISUAL_SAMPLE_ENTRY_FIELDS {
        return Err(malformed(entry.offset, "visual sample entry too small"));
    }

    // reserved(6) data_reference_index(2) pre_defined/reserved(16)
    let mut skip = [0u8; 24];
    reader.read_exact(&mut skip).map_err(truncated)?;
    let width = reader.read_u16::<BigEndian>().map_err(truncated)?;
    let height = reader.read_u16::<BigEndian>().map_err(truncated)?;
    // resolution(8) reserved(4) frame_count(2) compressorname(32)
    let mut skip = [0u8; 46];
    reader.read_exact(&mut skip).map_err(truncated)?;
    let depth = reader.read_u16::<BigEndian>().map_err(truncated)?;

    let mut sample = VisualSampleEntry {
        fourcc: entry.box_type,
        width,
        height,
        depth,
        config_record: None,
    };

    for_each_child(reader, &entry, VISUAL_SAMPLE_ENTRY_FIELDS, |reader, child| {
        if matches!(child.box_type, AVCC | HVCC) {
            let mut record = vec![0u8; child.content_size() as usize];
            reader.read_exact(&mut record).map_err(truncated)?;
            sample.config_record = Some(record);
        }
        Ok(())
    })?;

    debug!(
        codec = %fourcc_to_string(sample.fourcc),
        width, height, depth,
        "stsd video entry"
    );
    Ok(Some(sample))
}

// ─── Sample Table Boxes (stbl children) ─────────────────────────────

fn read_entry_count<R: Read>(reader: &mut R) -> PipelineResult<usize> {
    read_version_flags(reader)?;
    Ok(reader.read_u32::<BigEndian>().map_err(truncated)? as usize)
}

/// Cap preallocation so a corrupt count cannot exhaust memory up front.
fn bounded_capacity(count: usize) -> usize {
    count.min(1 << 16)
}

fn parse_stts<R: Read>(reader: &mut R) -> PipelineResult<Vec<SttsEntry>> {
    let count = read_entry_count(reader)?;
    let mut entries = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        entries.push(SttsEntry {
            sample_count: reader.read_u32::<BigEndian>().map_err(truncated)?,
            sample_delta: reader.read_u32::<BigEndian>().map_err(truncated)?,
        });
    }
    Ok(entries)
}

fn parse_ctts<R: Read>(reader: &mut R) -> PipelineResult<Vec<CttsEntry>> {
    let (version, _) = read_version_flags(reader)?;
    let count = reader.read_u32::<BigEndian>().map_err(truncated)? as usize;
    let mut entries = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        let sample_count = reader.read_u32::<BigEndian>().map_err(truncated)?;
        let sample_offset = if version == 0 {
            reader.read_u32::<BigEndian>().map_err(truncated)? as i32
        } else {
            reader.read_i32::<BigEndian>().map_err(truncated)?
        };
        entries.push(CttsEntry {
            sample_count,
            sample_offset,
        });
    }
    Ok(entries)
}

fn parse_stsc<R: Read>(reader: &mut R) -> PipelineResult<Vec<StscEntry>> {
    let count = read_entry_count(reader)?;
    let mut entries = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        let first_chunk = reader.read_u32::<BigEndian>().map_err(truncated)?;
        let samples_per_chunk = reader.read_u32::<BigEndian>().map_err(truncated)?;
        reader.read_u32::<BigEndian>().map_err(truncated)?; // sample_description_index
        entries.push(StscEntry {
            first_chunk,
            samples_per_chunk,
        });
    }
    Ok(entries)
}

fn parse_stsz<R: Read>(reader: &mut R) -> PipelineResult<StszBox> {
    read_version_flags(reader)?;
    let default_sample_size = reader.read_u32::<BigEndian>().map_err(truncated)?;
    let sample_count = reader.read_u32::<BigEndian>().map_err(truncated)?;
    let mut sample_sizes = Vec::new();
    if default_sample_size == 0 {
        sample_sizes.reserve(bounded_capacity(sample_count as usize));
        for _ in 0..sample_count {
            sample_sizes.push(reader.read_u32::<BigEndian>().map_err(truncated)?);
        }
    }
    Ok(StszBox {
        default_sample_size,
        sample_sizes,
        sample_count,
    })
}

fn parse_stco<R: Read>(reader: &mut R) -> PipelineResult<Vec<u64>> {
    let count = read_entry_count(reader)?;
    let mut offsets = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        offsets.push(reader.read_u32::<BigEndian>().map_err(truncated)? as u64);
    }
    Ok(offsets)
}

fn parse_co64<R: Read>(reader: &mut R) -> PipelineResult<Vec<u64>> {
    let count = read_entry_count(reader)?;
    let mut offsets = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        offsets.push(reader.read_u64::<BigEndian>().map_err(truncated)?);
    }
    Ok(offsets)
}

fn parse_stss<R: Read>(reader: &mut R) -> PipelineResult<Vec<u32>> {
    let count = read_entry_count(reader)?;
    let mut samples = Vec::with_capacity(bounded_capacity(count));
    for _ in 0..count {
        samples.push(reader.read_u32::<BigEndian>().map_err(truncated)?);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fourcc_round_trip() {
        assert_eq!(fourcc_to_string(MOOV), "moov");
        assert_eq!(fourcc_to_string(RAW_), "raw ");
    }

    #[test]
    fn test_read_box_header_sizes() {
        let mut data = Vec::new();
        data.extend_from_slice(&16u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);

        let mut cursor = Cursor::new(data);
        let free = read_box_header(&mut cursor).unwrap().unwrap();
        assert_eq!(free.box_type, fourcc(b"free"));
        assert_eq!(free.end, 16);
        skip_box(&mut cursor, &free).unwrap();

        let mdat = read_box_header(&mut cursor).unwrap().unwrap();
        assert_eq!(mdat.header_size, 16);
        assert_eq!(mdat.content_size(), 4);
        skip_box(&mut cursor, &mdat).unwrap();
        assert!(read_box_header(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_size_zero_box_extends_to_eof() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[7u8; 10]);
        let mut cursor = Cursor::new(data);
        let mdat = read_box_header(&mut cursor).unwrap().unwrap();
        assert_eq!(mdat.end, 18);
        assert_eq!(cursor.position(), 8);
    }

    #[test]
    fn test_garbage_is_not_a_container() {
        let mut cursor = Cursor::new(vec![0x1a, 0x45, 0xdf, 0xa3, 0x93, 0x42, 0x82, 0x88]);
        let err = parse_movie(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), "container");
    }

    #[test]
    fn test_missing_moov_is_container_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&16u32.to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(b"isom");
        data.extend_from_slice(&[0u8; 4]);
        let err = parse_movie(&mut Cursor::new(data)).unwrap_err();
        assert!(err.to_string().contains("moov"));
    }
}
