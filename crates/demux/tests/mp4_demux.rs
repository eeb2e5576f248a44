use std::io::Cursor;

use grabme_demux::{ChunkKind, DecoderConfig, Demuxer, RawMp4Writer, VideoCodec};

fn synthetic(frames: u32, fps: u32) -> Vec<u8> {
    let mut writer = RawMp4Writer::new(Cursor::new(Vec::new()), 4, 2, fps).unwrap();
    for i in 0..frames {
        writer.write_frame(&vec![i as u8; 4 * 2 * 3]).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn demuxer(frames: u32, fps: u32) -> Demuxer {
    Demuxer::from_reader(Cursor::new(synthetic(frames, fps)), "synthetic")
}

#[test]
fn test_initialize_reports_track_metadata() {
    let mut demux = demuxer(30, 30);
    let info = demux.initialize().unwrap();

    assert_eq!(info.decoder_config.codec, VideoCodec::RawRgb24);
    assert_eq!((info.width, info.height), (4, 2));
    assert!((info.fps - 30.0).abs() < 1e-9);
    assert_eq!(info.frame_count, 30);
    assert_eq!(info.keyframe_count, 30);
    assert!((info.duration_ms - 1_000.0).abs() < 0.01);
    assert_eq!(info.brand.as_deref(), Some("isom"));
}

#[test]
fn test_chunks_cover_the_whole_track_in_order() {
    let mut demux = demuxer(10, 10);
    demux.initialize().unwrap();

    let chunks: Vec<_> = demux
        .chunks_from(0.0, None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(chunks.len(), 10);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.decode_index, i as u32);
        assert_eq!(chunk.timestamp_us, i as i64 * 100_000);
        assert_eq!(chunk.duration_us, 100_000);
        assert_eq!(chunk.kind, ChunkKind::Key);
        assert!(chunk.payload.iter().all(|&b| b == i as u8));
    }
}

#[test]
fn test_chunk_range_is_bounded_and_restartable() {
    let mut demux = demuxer(10, 10);
    demux.initialize().unwrap();

    let first: Vec<i64> = demux
        .chunks_from(250.0, Some(600.0))
        .unwrap()
        .map(|c| c.unwrap().timestamp_us)
        .collect();
    assert_eq!(first, vec![200_000, 300_000, 400_000, 500_000]);

    let again = demux.chunks_from(250.0, Some(600.0)).unwrap().count();
    assert_eq!(again, 4);

    assert_eq!(demux.chunks_from(500.0, Some(500.0)).unwrap().count(), 0);
}

#[test]
fn test_seek_to_keyframe() {
    let mut demux = demuxer(10, 10);
    demux.initialize().unwrap();
    assert_eq!(demux.seek_to_keyframe(349.0).unwrap(), 300.0);
    assert_eq!(demux.seek_to_keyframe(-20.0).unwrap(), 0.0);
    assert_eq!(demux.seek_to_keyframe(99_999.0).unwrap(), 900.0);
}

#[test]
fn test_not_a_container() {
    let mut demux = Demuxer::from_reader(Cursor::new(b"RIFF\x00\x00\x00\x00WAVE".to_vec()), "wav");
    let err = demux.initialize().unwrap_err();
    assert_eq!(err.kind(), "container");
    assert!(err.triggers_fallback());
}

/// Overwrite one big-endian field of the `stsz` box (after its
/// version/flags word).
fn patch_stsz(bytes: &mut [u8], field: usize, value: u32) {
    let at = bytes
        .windows(4)
        .position(|w| w == b"stsz")
        .expect("stsz box present");
    let start = at + 8 + field * 4;
    bytes[start..start + 4].copy_from_slice(&value.to_be_bytes());
}

#[test]
fn test_absurd_sample_count_is_a_container_error() {
    let mut bytes = synthetic(4, 30);
    patch_stsz(&mut bytes, 1, 0x7fff_fff0);
    let mut demux = Demuxer::from_reader(Cursor::new(bytes), "malformed");
    let err = demux.initialize().unwrap_err();
    assert_eq!(err.kind(), "container");
}

#[test]
fn test_sample_size_past_end_of_file_is_a_container_error() {
    let mut bytes = synthetic(4, 30);
    patch_stsz(&mut bytes, 0, 0xffff_fff0);
    let mut demux = Demuxer::from_reader(Cursor::new(bytes), "malformed");
    let err = demux.initialize().unwrap_err();
    assert_eq!(err.kind(), "container");
}

#[test]
fn test_probe_rejection_is_codec_unsupported() {
    let mut demux = demuxer(3, 30);
    let err = demux
        .initialize_with(&|config: &DecoderConfig| config.codec == VideoCodec::H264)
        .unwrap_err();
    assert_eq!(err.kind(), "codec_unsupported");
    assert!(err.triggers_fallback());
}

#[test]
fn test_destroy_is_idempotent_and_closes_iterators() {
    let mut demux = demuxer(5, 30);
    demux.initialize().unwrap();
    let mut chunks = demux.chunks_from(0.0, None).unwrap();
    assert!(chunks.next().unwrap().is_ok());

    demux.destroy();
    demux.destroy();
    assert!(demux.is_destroyed());

    let err = chunks.next().unwrap().unwrap_err();
    assert_eq!(err.kind(), "closed");
    assert!(chunks.next().is_none());
    assert_eq!(demux.chunks_from(0.0, None).err().map(|e| e.kind()), Some("closed"));
}
