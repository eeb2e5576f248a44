//! Fast path: demuxer -> decoder service -> frame buffer.
//!
//! A decode-ahead task walks the container from a keyframe and feeds the
//! decoder while both the frame buffer and the decoder queue have room.
//! Decoded frames land in the buffer from the decoder thread. Requests
//! arrive in ascending order; everything older than the current request is
//! retired so decode-ahead never stalls on frames nobody will ask for.
//!
//! Gap policy: once decoding has moved past a target (or the stream ended)
//! without a frame inside the half-frame tolerance, the most recent frame
//! at or before the target is repeated. `FrameNotAvailable` is raised only
//! when no such frame exists.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use grabme_common::clock::{ms_to_us, us_to_ms, FrameTimebase};
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_decode::{
    DecodedFrame, DecoderService, DecoderSettings, ErrorCallback, FrameBuffer, FrameCallback,
};
use grabme_demux::Demuxer;

use super::{FrameSource, SourceCapabilities, SourceMode, SourceOptions, SourceStats};

const COMPONENT: &str = "frame source";
const BUDGET_RECHECK: Duration = Duration::from_millis(25);

/// Decode-ahead bookkeeping for the current run.
#[derive(Default)]
struct Progress {
    run: u64,
    /// Keyframe the current run started from.
    run_start_us: i64,
    /// Newest timestamp delivered in this run.
    decoded_through_us: Option<i64>,
    /// Newest timestamp evicted because decoding overran the buffer.
    lost_through_us: Option<i64>,
    submitted: u64,
    delivered: u64,
    /// Decoder regression drops counted before this run started.
    dropped_base: u64,
    finished: bool,
    run_error: Option<PipelineError>,
    destroyed: bool,
    /// Request waiters keyed by target timestamp.
    waiters: Vec<(i64, oneshot::Sender<()>)>,
}

impl Progress {
    fn register(&mut self, target_us: i64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push((target_us, tx));
        rx
    }

    /// Wake waiters whose target is at or before `timestamp_us`.
    fn wake_through(&mut self, timestamp_us: i64) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(target, _)| *target <= timestamp_us);
        self.waiters = waiting;
        for (_, tx) in ready {
            let _ = tx.send(());
        }
    }

    fn wake_all(&mut self) {
        for (_, tx) in self.waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    fn begin_run(&mut self, start_us: i64) -> u64 {
        self.run += 1;
        self.run_start_us = start_us;
        self.decoded_through_us = None;
        self.lost_through_us = None;
        self.submitted = 0;
        self.delivered = 0;
        self.finished = false;
        self.run_error = None;
        self.wake_all();
        self.run
    }

    /// Chunks handed to the decoder whose frame has not arrived yet.
    /// `dropped_total` is the decoder's lifetime regression-drop count.
    fn pending(&self, dropped_total: u64) -> u64 {
        let dropped = dropped_total.saturating_sub(self.dropped_base);
        self.submitted.saturating_sub(self.delivered + dropped)
    }
}

#[derive(Clone)]
struct Snapshot {
    run_start_us: i64,
    decoded_through_us: Option<i64>,
    lost_through_us: Option<i64>,
    finished: bool,
    run_error: Option<PipelineError>,
}

impl Snapshot {
    fn of(progress: &Progress) -> Self {
        Self {
            run_start_us: progress.run_start_us,
            decoded_through_us: progress.decoded_through_us,
            lost_through_us: progress.lost_through_us,
            finished: progress.finished,
            run_error: progress.run_error.clone(),
        }
    }
}

/// State shared with the decoder thread.
#[derive(Default)]
struct Tracker {
    progress: Mutex<Progress>,
    /// Signalled whenever buffer occupancy or pending decodes change.
    space: Notify,
}

impl Tracker {
    /// Decoder output callback.
    fn deliver(&self, buffer: &FrameBuffer, frame: DecodedFrame) {
        let timestamp_us = frame.timestamp_us();
        let evicting = if buffer.is_full() {
            buffer.oldest_timestamp()
        } else {
            None
        };
        if buffer.add_frame(frame).is_err() {
            self.progress.lock().delivered += 1;
            self.space.notify_one();
            return;
        }
        let full = buffer.is_full();
        {
            let mut progress = self.progress.lock();
            if let Some(lost) = evicting {
                trace!(lost_us = lost, "decode-ahead overran the frame buffer");
                progress.lost_through_us = Some(progress.lost_through_us.map_or(lost, |l| l.max(lost)));
            }
            progress.delivered += 1;
            progress.decoded_through_us = Some(
                progress
                    .decoded_through_us
                    .map_or(timestamp_us, |d| d.max(timestamp_us)),
            );
            if full {
                // Let the waiting request retire stale frames.
                progress.wake_all();
            } else {
                progress.wake_through(timestamp_us);
            }
        }
        self.space.notify_one();
    }

    /// Decoder error callback.
    fn fail(&self, err: PipelineError) {
        let mut progress = self.progress.lock();
        if progress.run_error.is_none() {
            progress.run_error = Some(err);
        }
        progress.wake_all();
    }

    fn finish_run(&self, run: u64, result: PipelineResult<()>) {
        let mut progress = self.progress.lock();
        if progress.run != run || progress.destroyed {
            return;
        }
        match result {
            Ok(()) => {
                debug!(run, "decode-ahead reached end of stream");
                progress.finished = true;
            }
            Err(PipelineError::Cancelled) => return,
            Err(err) => {
                debug!(run, error = %err, "decode-ahead stopped");
                if progress.run_error.is_none() {
                    progress.run_error = Some(err);
                }
            }
        }
        progress.wake_all();
    }
}

struct Inner {
    demuxer: Mutex<Demuxer>,
    decoder: DecoderService,
    buffer: Arc<FrameBuffer>,
    tracker: Arc<Tracker>,
}

impl Inner {
    async fn decode_ahead(self: Arc<Self>, run: u64, start_ms: f64, cancel: CancellationToken) {
        let result = self.feed(start_ms, &cancel).await;
        self.tracker.finish_run(run, result);
    }

    async fn feed(&self, start_ms: f64, cancel: &CancellationToken) -> PipelineResult<()> {
        let chunks = self.demuxer.lock().chunks_from(start_ms, None)?;
        for chunk in chunks {
            let chunk = chunk?;
            self.wait_for_budget(cancel).await?;
            self.decoder.wait_for_space(cancel).await?;
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            self.tracker.progress.lock().submitted += 1;
            if let Err(err) = self.decoder.decode(chunk) {
                let mut progress = self.tracker.progress.lock();
                progress.submitted = progress.submitted.saturating_sub(1);
                return Err(err);
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.decoder.flush() => result,
        }
    }

    /// Suspend until buffered plus in-flight frames fit the buffer.
    ///
    /// Holds even on an empty buffer: a decoder queue deeper than the buffer
    /// would otherwise evict frames nobody has asked for yet.
    async fn wait_for_budget(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        let capacity = self.buffer.capacity() as u64;
        loop {
            self.buffer.wait_for_space(cancel).await?;
            let dropped = self.decoder.stats().regressions_dropped;
            let pending = self.tracker.progress.lock().pending(dropped);
            let buffered = self.buffer.len() as u64;
            if buffered + pending < capacity {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = self.tracker.space.notified() => {}
                // Regression drops inside the decoder are not signalled.
                _ = tokio::time::sleep(BUDGET_RECHECK) => {}
            }
        }
    }
}

struct DecodeAhead {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Request-side state, serialized by the request lock.
#[derive(Default)]
struct Consumer {
    /// Last frame served (or the newest retired one); source of repeats.
    held: Option<DecodedFrame>,
    /// Whether the single decoder-reset recovery was used.
    recovered: bool,
}

/// Frame source backed by the in-process demuxer and decoder service.
pub struct FastFrameSource {
    path: PathBuf,
    options: SourceOptions,
    timebase: FrameTimebase,
    capabilities: Option<SourceCapabilities>,
    inner: Option<Arc<Inner>>,
    decode_ahead: Mutex<Option<DecodeAhead>>,
    request: tokio::sync::Mutex<Consumer>,
    counters: Mutex<SourceStats>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
}

impl FastFrameSource {
    pub fn new(path: impl AsRef<Path>, options: SourceOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            timebase: FrameTimebase::new(30.0),
            capabilities: None,
            inner: None,
            decode_ahead: Mutex::new(None),
            request: tokio::sync::Mutex::new(Consumer::default()),
            counters: Mutex::new(SourceStats::default()),
            cancel: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> PipelineResult<Arc<Inner>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed {
                component: COMPONENT,
            });
        }
        self.inner
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| PipelineError::config("frame source used before initialize()"))
    }

    fn tolerance_us(&self) -> i64 {
        self.timebase.frame_duration_us() / 2
    }

    fn start_run(&self, inner: &Arc<Inner>, from_ms: f64) -> PipelineResult<()> {
        let keyframe_ms = inner.demuxer.lock().seek_to_keyframe(from_ms)?;
        let dropped = inner.decoder.stats().regressions_dropped;
        let run = {
            let mut progress = inner.tracker.progress.lock();
            let run = progress.begin_run(ms_to_us(keyframe_ms));
            progress.dropped_base = dropped;
            run
        };
        inner.tracker.space.notify_one();

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(Arc::clone(inner).decode_ahead(run, keyframe_ms, cancel.clone()));
        *self.decode_ahead.lock() = Some(DecodeAhead { cancel, handle });
        debug!(run, from_ms, keyframe_ms, "decode-ahead started");
        Ok(())
    }

    async fn stop_decode_ahead(&self) {
        let previous = self.decode_ahead.lock().take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            if let Err(err) = previous.handle.await {
                if err.is_panic() {
                    warn!("decode-ahead task panicked");
                }
            }
        }
    }

    /// Reset the decoder and decode again from the keyframe preceding
    /// `from_ms`.
    async fn restart(&self, inner: &Arc<Inner>, from_ms: f64, reason: &'static str) -> PipelineResult<()> {
        self.stop_decode_ahead().await;
        inner.decoder.reset()?;
        inner.decoder.reconfigure()?;
        inner.buffer.reset();
        self.start_run(inner, from_ms)?;
        self.counters.lock().restarts += 1;
        info!(from_ms, reason, "Decode-ahead restarted");
        Ok(())
    }

    /// Release buffered frames older than `limit_us`, keeping the newest of
    /// them as the repeat candidate.
    fn retire_before(&self, inner: &Inner, consumer: &mut Consumer, limit_us: i64) {
        if let Some(stale) = inner.buffer.consume_at_or_before(limit_us - 1) {
            let newer = consumer
                .held
                .as_ref()
                .map_or(true, |held| stale.timestamp_us() > held.timestamp_us());
            if newer {
                consumer.held = Some(stale);
            }
        }
        inner.buffer.evict_before(limit_us);
        inner.tracker.space.notify_one();
    }

    /// Serve `frame` and keep it as the repeat candidate.
    fn take(&self, inner: &Inner, consumer: &mut Consumer, frame: DecodedFrame) -> DecodedFrame {
        let served = frame.duplicate_at(frame.timestamp_us());
        consumer.held = Some(frame);
        inner.tracker.space.notify_one();
        self.counters.lock().frames_served += 1;
        served
    }

    fn repeat(&self, consumer: &Consumer, timestamp_us: i64, gap: bool) -> Option<DecodedFrame> {
        let frame = consumer.held.as_ref()?.duplicate_at(timestamp_us);
        let mut counters = self.counters.lock();
        counters.frames_served += 1;
        if gap {
            counters.frames_held += 1;
        }
        Some(frame)
    }

    async fn serve(
        &self,
        inner: &Arc<Inner>,
        consumer: &mut Consumer,
        index: u64,
        effective_ms: f64,
    ) -> PipelineResult<DecodedFrame> {
        let source_ms = self.options.remap.to_source(effective_ms);
        let target_us = ms_to_us(source_ms);
        let tolerance = self.tolerance_us();
        let seek_ahead_us = ms_to_us(self.options.pipeline.seek_ahead_threshold_ms as f64);
        let mut restarted = false;

        loop {
            self.retire_before(inner, consumer, target_us - tolerance);

            // Register before looking, so no delivery slips between.
            let (arrival, snap) = {
                let mut progress = inner.tracker.progress.lock();
                if progress.destroyed {
                    return Err(PipelineError::Closed {
                        component: COMPONENT,
                    });
                }
                (progress.register(target_us), Snapshot::of(&progress))
            };

            // Nearest candidate wins, earlier on a tie.
            let held = consumer
                .held
                .as_ref()
                .map(|h| h.timestamp_us())
                .filter(|ts| (ts - target_us).abs() <= tolerance);
            let buffered = inner.buffer.resolve_time(target_us);
            let prefer_held = match (held, buffered) {
                (Some(h), Some(b)) => {
                    let (dh, db) = ((h - target_us).abs(), (b - target_us).abs());
                    dh < db || (dh == db && h < b)
                }
                (Some(_), None) => true,
                _ => false,
            };
            if prefer_held {
                if let Some(frame) = held.and_then(|ts| self.repeat(consumer, ts, false)) {
                    return Ok(frame);
                }
            } else if buffered.is_some() {
                if let Some(frame) = inner.buffer.consume_at(target_us) {
                    return Ok(self.take(inner, consumer, frame));
                }
            }

            if let Some(err) = snap.run_error {
                if matches!(err, PipelineError::Decode { .. }) && !consumer.recovered {
                    consumer.recovered = true;
                    warn!(error = %err, "Decode error, resetting decoder once and restarting from keyframe");
                    self.counters.lock().decoder_resets += 1;
                    self.restart(inner, source_ms, "decode error").await?;
                    continue;
                }
                return Err(err);
            }

            if !restarted {
                let held_ts = consumer.held.as_ref().map(|h| h.timestamp_us());
                let behind_held = held_ts.map_or(false, |h| h > target_us + tolerance);
                let behind_run = target_us + tolerance < snap.run_start_us;
                let lost = snap
                    .lost_through_us
                    .map_or(false, |lost| lost >= target_us - tolerance);
                if behind_held || behind_run || lost {
                    restarted = true;
                    if behind_held {
                        consumer.held = None;
                    }
                    self.restart(inner, source_ms, "request behind decoded frames")
                        .await?;
                    continue;
                }

                let position = snap.decoded_through_us.unwrap_or(snap.run_start_us);
                if target_us - position > seek_ahead_us {
                    let keyframe_us = ms_to_us(inner.demuxer.lock().seek_to_keyframe(source_ms)?);
                    if keyframe_us > position {
                        restarted = true;
                        self.restart(inner, source_ms, "request beyond seek-ahead threshold")
                            .await?;
                        continue;
                    }
                }
            }

            let passed = snap.finished
                || snap
                    .decoded_through_us
                    .map_or(false, |d| d > target_us + tolerance);
            if passed {
                if let Some(candidate) = inner.buffer.consume_at_or_before(target_us) {
                    let newer = consumer
                        .held
                        .as_ref()
                        .map_or(true, |h| candidate.timestamp_us() > h.timestamp_us());
                    if newer {
                        consumer.held = Some(candidate);
                    }
                }
                let holdable = consumer
                    .held
                    .as_ref()
                    .map_or(false, |h| h.timestamp_us() <= target_us);
                if holdable {
                    if let Some(frame) = self.repeat(consumer, target_us, true) {
                        trace!(index, target_us, "holding previous frame across gap");
                        return Ok(frame);
                    }
                }
                return Err(PipelineError::FrameNotAvailable {
                    index,
                    time_ms: effective_ms,
                });
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(PipelineError::Closed { component: COMPONENT });
                }
                _ = arrival => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for FastFrameSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Fast
    }

    async fn initialize(&mut self) -> PipelineResult<SourceCapabilities> {
        if let Some(capabilities) = &self.capabilities {
            return Ok(capabilities.clone());
        }
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed {
                component: COMPONENT,
            });
        }

        let mut demuxer = Demuxer::open(&self.path)?;
        let info = demuxer.initialize_with(&self.options.registry)?;
        let timebase = FrameTimebase::new(info.fps);
        let buffer = Arc::new(FrameBuffer::new(
            self.options.pipeline.frame_buffer_capacity,
            timebase,
        ));
        let tracker = Arc::new(Tracker::default());

        let output: FrameCallback = {
            let buffer = Arc::clone(&buffer);
            let tracker = Arc::clone(&tracker);
            Box::new(move |frame: DecodedFrame| tracker.deliver(&buffer, frame))
        };
        let on_error: ErrorCallback = {
            let tracker = Arc::clone(&tracker);
            Box::new(move |err: PipelineError| tracker.fail(err))
        };
        let decoder = DecoderService::new(
            self.options.registry.clone(),
            DecoderSettings::from(&self.options.pipeline),
            self.options.accounting.clone(),
            output,
            Some(on_error),
        )?;
        decoder.configure(&info.decoder_config)?;

        let inner = Arc::new(Inner {
            demuxer: Mutex::new(demuxer),
            decoder,
            buffer,
            tracker,
        });
        self.timebase = timebase;
        self.start_run(&inner, self.options.remap.to_source(0.0))?;
        self.inner = Some(inner);

        let capabilities = SourceCapabilities {
            mode: SourceMode::Fast,
            width: info.width,
            height: info.height,
            fps: info.fps,
            duration_ms: info.duration_ms,
            frame_count: info.frame_count,
            codec: info.decoder_config.codec_string.clone(),
        };
        info!(
            path = %self.path.display(),
            fps = info.fps,
            frames = info.frame_count,
            buffer = self.options.pipeline.frame_buffer_capacity,
            "Fast frame source ready"
        );
        self.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    async fn get_frame(&self, index: u64, effective_time_ms: f64) -> PipelineResult<DecodedFrame> {
        let started = Instant::now();
        let inner = self.inner()?;
        let mut consumer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PipelineError::Closed { component: COMPONENT });
            }
            guard = self.request.lock() => guard,
        };
        let result = self.serve(&inner, &mut consumer, index, effective_time_ms).await;
        drop(consumer);

        match &result {
            Ok(frame) => {
                self.counters.lock().get_frame_latency.record(started.elapsed());
                trace!(
                    index,
                    effective_ms = effective_time_ms,
                    source_ms = us_to_ms(frame.timestamp_us()),
                    "frame served"
                );
            }
            Err(err) => debug!(index, error = %err, "get_frame failed"),
        }
        result
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.decode_ahead.lock().take() {
            task.cancel.cancel();
        }
        if let Some(inner) = &self.inner {
            {
                let mut progress = inner.tracker.progress.lock();
                progress.destroyed = true;
                progress.wake_all();
            }
            inner.decoder.close();
            inner.buffer.destroy();
            inner.demuxer.lock().destroy();
        }
        if let Ok(mut consumer) = self.request.try_lock() {
            consumer.held = None;
        }
        info!(path = %self.path.display(), "Fast frame source destroyed");
    }

    fn stats(&self) -> SourceStats {
        let mut stats = self.counters.lock().clone();
        stats.mode = Some(SourceMode::Fast);
        if let Some(inner) = &self.inner {
            stats.buffer = Some(inner.buffer.stats());
            stats.decoder = Some(inner.decoder.stats());
        }
        stats.accounting = Some(self.options.accounting.snapshot());
        stats
    }
}

impl Drop for FastFrameSource {
    fn drop(&mut self) {
        self.destroy();
    }
}
