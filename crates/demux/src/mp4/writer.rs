//! Minimal MP4 writer for uncompressed RGB24 video.
//!
//! Produces a single `raw ` track with every frame in one chunk. Used to
//! generate synthetic recordings and test fixtures without an encoder.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use grabme_common::error::{PipelineError, PipelineResult};

const FTYP_SIZE: u64 = 28;
const MDAT_HEADER_SIZE: u64 = 16;
const TICKS_PER_FRAME: u32 = 1_000;

/// Streaming writer: frames go straight into `mdat`, `moov` is written on
/// [`RawMp4Writer::finish`].
pub struct RawMp4Writer<W: Write + Seek> {
    out: W,
    width: u32,
    height: u32,
    fps: u32,
    frames: u32,
}

impl RawMp4Writer<BufWriter<File>> {
    /// Create (or truncate) a file at `path`.
    pub fn create(path: impl AsRef<Path>, width: u32, height: u32, fps: u32) -> PipelineResult<Self> {
        let file = File::create(path.as_ref())?;
        Self::new(BufWriter::new(file), width, height, fps)
    }
}

impl<W: Write + Seek> RawMp4Writer<W> {
    pub fn new(mut out: W, width: u32, height: u32, fps: u32) -> PipelineResult<Self> {
        if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(PipelineError::config(format!(
                "unsupported frame size {width}x{height}"
            )));
        }
        if fps == 0 {
            return Err(PipelineError::config("fps must be positive"));
        }

        let mut head = Vec::with_capacity((FTYP_SIZE + MDAT_HEADER_SIZE) as usize);
        write_box(&mut head, b"ftyp", |b| {
            b.extend_from_slice(b"isom");
            put_u32(b, 0x200);
            b.extend_from_slice(b"isomiso2mp41");
        });
        // mdat with a 64-bit size, patched in finish().
        put_u32(&mut head, 1);
        head.extend_from_slice(b"mdat");
        put_u64(&mut head, MDAT_HEADER_SIZE);

        out.seek(SeekFrom::Start(0))?;
        out.write_all(&head)?;

        Ok(Self {
            out,
            width,
            height,
            fps,
            frames: 0,
        })
    }

    /// Bytes per packed RGB24 frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn frame_count(&self) -> u32 {
        self.frames
    }

    /// Append one tightly packed RGB24 frame.
    pub fn write_frame(&mut self, rgb: &[u8]) -> PipelineResult<()> {
        if rgb.len() != self.frame_size() {
            return Err(PipelineError::config(format!(
                "frame has {} bytes, expected {}",
                rgb.len(),
                self.frame_size()
            )));
        }
        self.out.write_all(rgb)?;
        self.frames += 1;
        Ok(())
    }

    /// Patch the `mdat` size, append `moov`, and return the inner writer.
    pub fn finish(mut self) -> PipelineResult<W> {
        if self.frames == 0 {
            return Err(PipelineError::config("no frames were written"));
        }
        let mdat_size = MDAT_HEADER_SIZE + self.frames as u64 * self.frame_size() as u64;
        let end = FTYP_SIZE + mdat_size;

        self.out.seek(SeekFrom::Start(FTYP_SIZE + 8))?;
        self.out.write_all(&mdat_size.to_be_bytes())?;
        self.out.seek(SeekFrom::Start(end))?;

        let moov = self.build_moov();
        self.out.write_all(&moov)?;
        self.out.flush()?;

        debug!(
            frames = self.frames,
            width = self.width,
            height = self.height,
            fps = self.fps,
            "raw MP4 written"
        );
        Ok(self.out)
    }

    fn build_moov(&self) -> Vec<u8> {
        let timescale = self.fps * TICKS_PER_FRAME;
        let duration = self.frames * TICKS_PER_FRAME;
        let frame_size = self.frame_size() as u32;
        let first_sample = (FTYP_SIZE + MDAT_HEADER_SIZE) as u32;
        let (width, height, frames) = (self.width, self.height, self.frames);

        let mut moov = Vec::with_capacity(1024);
        write_box(&mut moov, b"moov", |b| {
            write_box(b, b"mvhd", |b| {
                put_u32(b, 0); // version/flags
                put_u32(b, 0); // creation
                put_u32(b, 0); // modification
                put_u32(b, timescale);
                put_u32(b, duration);
                put_u32(b, 0x0001_0000); // rate 1.0
                put_u16(b, 0x0100); // volume 1.0
                b.extend_from_slice(&[0u8; 10]);
                put_matrix(b);
                b.extend_from_slice(&[0u8; 24]);
                put_u32(b, 2); // next_track_ID
            });
            write_box(b, b"trak", |b| {
                write_box(b, b"tkhd", |b| {
                    put_u32(b, 0x0000_0003); // enabled | in_movie
                    put_u32(b, 0);
                    put_u32(b, 0);
                    put_u32(b, 1); // track_ID
                    put_u32(b, 0);
                    put_u32(b, duration);
                    b.extend_from_slice(&[0u8; 8]);
                    put_u16(b, 0); // layer
                    put_u16(b, 0); // alternate_group
                    put_u16(b, 0); // volume
                    put_u16(b, 0);
                    put_matrix(b);
                    put_u32(b, width << 16);
                    put_u32(b, height << 16);
                });
                write_box(b, b"mdia", |b| {
                    write_box(b, b"mdhd", |b| {
                        put_u32(b, 0);
                        put_u32(b, 0);
                        put_u32(b, 0);
                        put_u32(b, timescale);
                        put_u32(b, duration);
                        put_u16(b, 0x55c4); // "und"
                        put_u16(b, 0);
                    });
                    write_box(b, b"hdlr", |b| {
                        put_u32(b, 0);
                        put_u32(b, 0);
                        b.extend_from_slice(b"vide");
                        b.extend_from_slice(&[0u8; 12]);
                        b.extend_from_slice(b"VideoHandler\0");
                    });
                    write_box(b, b"minf", |b| {
                        write_box(b, b"vmhd", |b| {
                            put_u32(b, 1);
                            b.extend_from_slice(&[0u8; 8]);
                        });
                        write_box(b, b"dinf", |b| {
                            write_box(b, b"dref", |b| {
                                put_u32(b, 0);
                                put_u32(b, 1);
                                write_box(b, b"url ", |b| put_u32(b, 1));
                            });
                        });
                        write_box(b, b"stbl", |b| {
                            write_box(b, b"stsd", |b| {
                                put_u32(b, 0);
                                put_u32(b, 1);
                                write_box(b, b"raw ", |b| {
                                    b.extend_from_slice(&[0u8; 6]);
                                    put_u16(b, 1); // data_reference_index
                                    b.extend_from_slice(&[0u8; 16]);
                                    put_u16(b, width as u16);
                                    put_u16(b, height as u16);
                                    put_u32(b, 0x0048_0000); // 72 dpi
                                    put_u32(b, 0x0048_0000);
                                    put_u32(b, 0);
                                    put_u16(b, 1); // frame_count
                                    b.extend_from_slice(&[0u8; 32]);
                                    put_u16(b, 24); // depth
                                    put_u16(b, 0xFFFF);
                                });
                            });
                            write_box(b, b"stts", |b| {
                                put_u32(b, 0);
                                put_u32(b, 1);
                                put_u32(b, frames);
                                put_u32(b, TICKS_PER_FRAME);
                            });
                            write_box(b, b"stsc", |b| {
                                put_u32(b, 0);
                                put_u32(b, 1);
                                put_u32(b, 1);
                                put_u32(b, frames);
                                put_u32(b, 1);
                            });
                            write_box(b, b"stsz", |b| {
                                put_u32(b, 0);
                                put_u32(b, frame_size);
                                put_u32(b, frames);
                            });
                            write_box(b, b"stco", |b| {
                                put_u32(b, 0);
                                put_u32(b, 1);
                                put_u32(b, first_sample);
                            });
                        });
                    });
                });
            });
        });
        moov
    }
}

fn write_box(buf: &mut Vec<u8>, kind: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_matrix(buf: &mut Vec<u8>) {
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        put_u32(buf, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut writer = RawMp4Writer::new(Cursor::new(Vec::new()), 4, 4, 30).unwrap();
        assert!(writer.write_frame(&[0u8; 10]).is_err());
        assert_eq!(writer.frame_count(), 0);
    }

    #[test]
    fn test_layout_offsets() {
        let mut writer = RawMp4Writer::new(Cursor::new(Vec::new()), 2, 2, 10).unwrap();
        writer.write_frame(&[1u8; 12]).unwrap();
        writer.write_frame(&[2u8; 12]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        assert_eq!(&bytes[4..8], b"ftyp");
        assert_eq!(&bytes[32..36], b"mdat");
        assert_eq!(u64::from_be_bytes(bytes[36..44].try_into().unwrap()), 16 + 24);
        assert_eq!(bytes[44], 1);
        assert_eq!(bytes[56], 2);
        assert_eq!(&bytes[72..76], b"moov");
    }

    #[test]
    fn test_empty_finish_is_an_error() {
        let writer = RawMp4Writer::new(Cursor::new(Vec::new()), 2, 2, 10).unwrap();
        assert!(writer.finish().is_err());
    }
}
