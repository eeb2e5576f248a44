use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use grabme_common::clock::FrameTimebase;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_decode::{
    DecodedFrame, DecodedImage, DecoderBackend, DecoderRegistry, DecoderService, DecoderSettings,
    DecoderState, FrameAccounting, FrameBuffer, RawVideoBackend, RgbaImage, VideoDecoder,
};
use grabme_demux::{ChunkKind, DecoderConfig, Demuxer, EncodedChunk, RawMp4Writer, VideoCodec};

/// Decodes one chunk per permit received; blocks otherwise.
struct GatedBackend {
    permits: Receiver<()>,
}

struct GatedDecoder {
    permits: Receiver<()>,
}

impl DecoderBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn supports(&self, _config: &DecoderConfig) -> bool {
        true
    }

    fn create(&self) -> PipelineResult<Box<dyn VideoDecoder>> {
        Ok(Box::new(GatedDecoder {
            permits: self.permits.clone(),
        }))
    }
}

impl VideoDecoder for GatedDecoder {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn configure(&mut self, _config: &DecoderConfig) -> PipelineResult<()> {
        Ok(())
    }

    fn decode(&mut self, chunk: &EncodedChunk) -> PipelineResult<Vec<DecodedImage>> {
        self.permits
            .recv()
            .map_err(|_| PipelineError::decode("gate closed"))?;
        Ok(vec![DecodedImage {
            timestamp_us: chunk.timestamp_us,
            duration_us: chunk.duration_us,
            image: RgbaImage::filled(1, 1, [255, 0, 0, 255])?,
        }])
    }

    fn flush(&mut self) -> PipelineResult<Vec<DecodedImage>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {}
}

fn config() -> DecoderConfig {
    DecoderConfig {
        codec: VideoCodec::Other("test".into()),
        codec_string: "test".into(),
        width: 1,
        height: 1,
        extra_data: None,
    }
}

fn chunk(index: u32, timestamp_us: i64) -> EncodedChunk {
    EncodedChunk {
        timestamp_us,
        duration_us: 33_333,
        kind: ChunkKind::Key,
        payload: Bytes::new(),
        decode_index: index,
    }
}

fn gated_service(
    queue_size: usize,
    flush_timeout: Duration,
) -> (DecoderService, Sender<()>, Arc<Mutex<Vec<i64>>>) {
    let (permit_tx, permit_rx) = unbounded();
    let mut registry = DecoderRegistry::new();
    registry.register(Arc::new(GatedBackend { permits: permit_rx }));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let service = DecoderService::new(
        registry,
        DecoderSettings {
            queue_size,
            flush_timeout,
        },
        FrameAccounting::new(),
        Box::new(move |frame: DecodedFrame| sink.lock().push(frame.timestamp_us())),
        None,
    )
    .unwrap();
    service.configure(&config()).unwrap();
    (service, permit_tx, seen)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn test_full_queue_rejects_and_waiters_resolve_in_call_order() {
    let (service, permits, _seen) = gated_service(2, Duration::from_secs(5));
    let service = Arc::new(service);

    service.decode(chunk(0, 0)).unwrap();
    service.decode(chunk(1, 33_333)).unwrap();
    assert!(!service.can_accept_chunk());
    let err = service.decode(chunk(2, 66_666)).unwrap_err();
    assert!(matches!(err, PipelineError::QueueFull { queue: "decoder" }));

    let cancel = CancellationToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for id in ["first", "second"] {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            service.wait_for_space(&cancel).await.unwrap();
            order.lock().push(id);
        }));
        // Register in a known order.
        settle().await;
    }

    permits.send(()).unwrap();
    settle().await;
    assert_eq!(*order.lock(), vec!["first"]);

    permits.send(()).unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock(), vec!["first", "second"]);
    assert_eq!(service.stats().chunks_decoded, 2);
}

#[tokio::test]
async fn test_flush_times_out_when_decoder_stalls() {
    let (service, permits, _seen) = gated_service(4, Duration::from_millis(50));
    service.decode(chunk(0, 0)).unwrap();

    let err = service.flush().await.unwrap_err();
    assert!(matches!(err, PipelineError::Timeout { .. }));

    drop(permits);
    service.close();
}

#[tokio::test]
async fn test_flush_delivers_frames_in_decode_order() {
    let (service, permits, seen) = gated_service(4, Duration::from_secs(5));
    for i in 0..3 {
        permits.send(()).unwrap();
        service.wait_for_space(&CancellationToken::new()).await.unwrap();
        service.decode(chunk(i, i as i64 * 33_333)).unwrap();
    }
    service.flush().await.unwrap();
    assert_eq!(*seen.lock(), vec![0, 33_333, 66_666]);
    assert!(matches!(service.state(), DecoderState::Configured));
}

#[tokio::test]
async fn test_regressing_timestamps_are_dropped() {
    let (service, permits, seen) = gated_service(4, Duration::from_secs(5));
    for (i, ts) in [0, 200_000, 100_000, 300_000].into_iter().enumerate() {
        permits.send(()).unwrap();
        service.decode(chunk(i as u32, ts)).unwrap();
        settle().await;
    }
    service.flush().await.unwrap();
    assert_eq!(*seen.lock(), vec![0, 200_000, 300_000]);
    assert_eq!(service.stats().regressions_dropped, 1);
}

#[tokio::test]
async fn test_close_fails_space_waiters() {
    let (service, permits, _seen) = gated_service(1, Duration::from_secs(5));
    let service = Arc::new(service);
    service.decode(chunk(0, 0)).unwrap();

    let waiter = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.wait_for_space(&CancellationToken::new()).await })
    };
    settle().await;

    let closer = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || service.close())
    };
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Closed { .. }));

    drop(permits);
    closer.join().unwrap();
    service.close();
    assert!(matches!(service.state(), DecoderState::Closed(None)));
    assert!(service.decode(chunk(1, 1)).is_err());
}

#[tokio::test]
async fn test_reset_fails_waiters_and_allows_reconfigure() {
    let (service, permits, seen) = gated_service(1, Duration::from_secs(5));
    let service = Arc::new(service);
    service.decode(chunk(0, 0)).unwrap();

    let waiter = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.wait_for_space(&CancellationToken::new()).await })
    };
    settle().await;

    service.reset().unwrap();
    service.reset().unwrap();
    assert!(waiter.await.unwrap().is_err());
    assert!(matches!(service.state(), DecoderState::Unconfigured));

    // The stale chunk finishes but is not delivered.
    permits.send(()).unwrap();
    service.reconfigure().unwrap();
    permits.send(()).unwrap();
    service.decode(chunk(1, 500_000)).unwrap();
    service.flush().await.unwrap();
    assert_eq!(*seen.lock(), vec![500_000]);
}

#[tokio::test]
async fn test_decode_error_is_sticky() {
    let (service, permits, _seen) = gated_service(2, Duration::from_secs(5));
    drop(permits);
    service.decode(chunk(0, 0)).unwrap();
    settle().await;

    let err = service.wait_for_space(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), "decode");
    assert_eq!(service.decode(chunk(1, 1)).unwrap_err().kind(), "decode");
    assert_eq!(service.stats().errors, 1);
}

#[tokio::test]
async fn test_unsupported_config_leaves_service_untouched() {
    let mut registry = DecoderRegistry::new();
    registry.register(Arc::new(RawVideoBackend));
    let service = DecoderService::new(
        registry,
        DecoderSettings::default(),
        FrameAccounting::new(),
        Box::new(|frame: DecodedFrame| frame.release()),
        None,
    )
    .unwrap();

    let mut h264 = config();
    h264.codec = VideoCodec::H264;
    let err = service.configure(&h264).unwrap_err();
    assert_eq!(err.kind(), "codec_unsupported");
    assert!(matches!(service.state(), DecoderState::Unconfigured));
    assert!(service.last_config().is_none());
}

#[tokio::test]
async fn test_raw_mp4_decodes_into_frame_buffer() {
    let mut writer = RawMp4Writer::new(Cursor::new(Vec::new()), 2, 2, 10).unwrap();
    for i in 0..8u8 {
        writer.write_frame(&[i; 12]).unwrap();
    }
    let bytes = writer.finish().unwrap().into_inner();
    let mut demux = Demuxer::from_reader(Cursor::new(bytes), "raw");
    let info = demux.initialize().unwrap();

    let accounting = FrameAccounting::new();
    let buffer = Arc::new(FrameBuffer::new(16, FrameTimebase::new(info.fps)));
    let output = {
        let buffer = Arc::clone(&buffer);
        Box::new(move |frame: DecodedFrame| {
            let _ = buffer.add_frame(frame);
        })
    };
    let service = DecoderService::new(
        DecoderRegistry::with_defaults(),
        DecoderSettings::default(),
        accounting.clone(),
        output,
        None,
    )
    .unwrap();
    service.configure(&info.decoder_config).unwrap();

    let cancel = CancellationToken::new();
    for chunk in demux.chunks_from(0.0, None).unwrap() {
        service.wait_for_space(&cancel).await.unwrap();
        service.decode(chunk.unwrap()).unwrap();
    }
    service.flush().await.unwrap();

    assert_eq!(buffer.len(), 8);
    let third = buffer.consume_frame(3).unwrap();
    assert_eq!(third.image().pixel(0, 0), [3, 3, 3, 255]);
    third.release();

    service.close();
    buffer.destroy();
    assert_eq!(accounting.outstanding(), 0);
    assert_eq!(accounting.allocated(), 8);
}
