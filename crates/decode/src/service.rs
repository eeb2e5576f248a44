//! Decoder service: a dedicated decode thread behind a bounded queue.
//!
//! Chunks are moved to the decode thread over a crossbeam channel. Each
//! queued chunk holds one slot of a [`CapacityGate`]; finishing a chunk is
//! the dequeue event that wakes the longest-waiting `wait_for_space` caller.
//!
//! The output callback runs on the decode thread and must not call
//! [`DecoderService::reset`] or [`DecoderService::close`].

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use grabme_common::backpressure::CapacityGate;
use grabme_common::config::PipelineConfig;
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_common::stats::LatencyStats;
use grabme_demux::{CodecProbe, DecoderConfig, EncodedChunk};

use crate::backend::{DecodedImage, DecoderRegistry, VideoDecoder};
use crate::frame::{DecodedFrame, FrameAccounting};

/// Receives decoded frames in decode order.
pub type FrameCallback = Box<dyn FnMut(DecodedFrame) + Send>;
/// Receives decode errors as they happen.
pub type ErrorCallback = Box<dyn FnMut(PipelineError) + Send>;

/// Lifecycle of a [`DecoderService`].
#[derive(Debug, Clone)]
pub enum DecoderState {
    Unconfigured,
    Configured,
    Decoding,
    Draining,
    /// Closed by `close()` (`None`) or by a decode error.
    Closed(Option<PipelineError>),
}

impl DecoderState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Decoding => "decoding",
            Self::Draining => "draining",
            Self::Closed(None) => "closed",
            Self::Closed(Some(_)) => "failed",
        }
    }
}

impl fmt::Display for DecoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Queue size and flush timeout for one service.
#[derive(Debug, Clone, Copy)]
pub struct DecoderSettings {
    pub queue_size: usize,
    pub flush_timeout: Duration,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for DecoderSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            queue_size: config.decoder_queue_size.max(1),
            flush_timeout: config.decoder_flush_timeout(),
        }
    }
}

/// Decoder counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecoderStats {
    pub state: String,
    pub backend: Option<&'static str>,
    pub chunks_submitted: u64,
    pub chunks_decoded: u64,
    pub frames_output: u64,
    /// Frames dropped because their timestamp went backwards.
    pub regressions_dropped: u64,
    pub queue_depth: usize,
    pub peak_queue_depth: usize,
    pub errors: u64,
    pub resets: u64,
    pub decode_latency: LatencyStats,
}

enum Command {
    Install {
        generation: u64,
        decoder: Box<dyn VideoDecoder>,
    },
    Decode {
        generation: u64,
        chunk: EncodedChunk,
        queued_at: Instant,
    },
    Flush {
        generation: u64,
        reply: oneshot::Sender<PipelineResult<()>>,
    },
    Reset,
    Shutdown,
}

struct Inner {
    state: DecoderState,
    generation: u64,
    last_config: Option<DecoderConfig>,
    stats: DecoderStats,
}

struct Shared {
    queue: CapacityGate,
    inner: Mutex<Inner>,
    /// Held while frames are handed to the output callback, so `reset`
    /// can wait out an in-progress delivery.
    delivery: Mutex<()>,
    accounting: FrameAccounting,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// Dequeue bookkeeping for a finished chunk. Returns false when the
    /// chunk belongs to a generation discarded by reset/close.
    fn complete_chunk(&self, generation: u64, latency: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.stats.chunks_decoded += 1;
        inner.stats.decode_latency.record(latency);
        self.queue.release();
        true
    }

    fn record_error(&self, generation: u64, err: PipelineError, on_error: &mut Option<ErrorCallback>) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state.is_closed() {
                return;
            }
            inner.stats.errors += 1;
            inner.state = DecoderState::Closed(Some(err.clone()));
            self.queue.fail(err.clone());
        }
        error!(error = %err, "decoder failed");
        if let Some(callback) = on_error.as_mut() {
            callback(err);
        }
    }

    fn deliver(
        &self,
        generation: u64,
        images: Vec<DecodedImage>,
        last_pts: &mut Option<i64>,
        output: &mut FrameCallback,
    ) {
        for img in images {
            if matches!(*last_pts, Some(prev) if img.timestamp_us < prev) {
                debug!(
                    timestamp_us = img.timestamp_us,
                    previous_us = ?*last_pts,
                    "dropping frame with regressing timestamp"
                );
                self.inner.lock().stats.regressions_dropped += 1;
                continue;
            }

            let _delivery = self.delivery.lock();
            if !self.is_current(generation) {
                return;
            }
            *last_pts = Some(img.timestamp_us);
            let frame = self
                .accounting
                .frame(img.timestamp_us, img.duration_us, img.image);
            self.inner.lock().stats.frames_output += 1;
            output(frame);
        }
    }
}

/// Bounded, thread-backed video decoder.
pub struct DecoderService {
    registry: DecoderRegistry,
    settings: DecoderSettings,
    shared: Arc<Shared>,
    commands: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DecoderService {
    /// Start the decode thread. Frames go to `output`, errors to `on_error`.
    pub fn new(
        registry: DecoderRegistry,
        settings: DecoderSettings,
        accounting: FrameAccounting,
        output: FrameCallback,
        on_error: Option<ErrorCallback>,
    ) -> PipelineResult<Self> {
        let shared = Arc::new(Shared {
            queue: CapacityGate::new("decoder", settings.queue_size.max(1)),
            inner: Mutex::new(Inner {
                state: DecoderState::Unconfigured,
                generation: 0,
                last_config: None,
                stats: DecoderStats::default(),
            }),
            delivery: Mutex::new(()),
            accounting,
        });

        let (tx, rx) = unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("grabme-decoder".into())
            .spawn(move || decode_loop(worker_shared, rx, output, on_error))?;

        Ok(Self {
            registry,
            settings,
            shared,
            commands: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn state(&self) -> DecoderState {
        self.shared.inner.lock().state.clone()
    }

    pub fn accounting(&self) -> &FrameAccounting {
        &self.shared.accounting
    }

    /// The config applied by the last successful `configure`.
    pub fn last_config(&self) -> Option<DecoderConfig> {
        self.shared.inner.lock().last_config.clone()
    }

    fn send(&self, command: Command) -> PipelineResult<()> {
        let commands = self.commands.lock();
        let tx = commands.as_ref().ok_or(PipelineError::Closed {
            component: "decoder",
        })?;
        tx.send(command).map_err(|_| PipelineError::Closed {
            component: "decoder",
        })
    }

    /// Configure for `config`. A config no backend supports fails with
    /// `CodecUnsupported` and leaves the service as it was.
    pub fn configure(&self, config: &DecoderConfig) -> PipelineResult<()> {
        if let DecoderState::Closed(None) = self.state() {
            return Err(PipelineError::Closed {
                component: "decoder",
            });
        }
        if !self.registry.supports(config) {
            return Err(PipelineError::codec_unsupported(
                config.codec_string.clone(),
                "no decoder backend accepts this configuration",
            ));
        }

        let mut decoder = self.registry.create(config)?;
        decoder.configure(config)?;
        let backend = decoder.name();

        let mut inner = self.shared.inner.lock();
        if let DecoderState::Closed(Some(err)) = &inner.state {
            return Err(err.clone());
        }
        self.send(Command::Install {
            generation: inner.generation,
            decoder,
        })?;
        inner.state = DecoderState::Configured;
        inner.last_config = Some(config.clone());
        inner.stats.backend = Some(backend);
        drop(inner);

        info!(
            backend,
            codec = %config.codec,
            width = config.width,
            height = config.height,
            "Decoder configured"
        );
        Ok(())
    }

    /// Configure again with the last applied config (after `reset`).
    pub fn reconfigure(&self) -> PipelineResult<()> {
        let config = self
            .last_config()
            .ok_or_else(|| PipelineError::config("decoder was never configured"))?;
        self.configure(&config)
    }

    fn check_usable(&self) -> PipelineResult<()> {
        match &self.shared.inner.lock().state {
            DecoderState::Closed(Some(err)) => Err(err.clone()),
            DecoderState::Closed(None) => Err(PipelineError::Closed {
                component: "decoder",
            }),
            DecoderState::Unconfigured => Err(PipelineError::config("decoder is not configured")),
            _ => Ok(()),
        }
    }

    /// Whether a chunk can be queued right now.
    pub fn can_accept_chunk(&self) -> bool {
        self.check_usable().is_ok() && self.shared.queue.has_space()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.in_flight()
    }

    /// Suspend until the queue has room. Callers resolve in call order.
    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        self.check_usable()?;
        self.shared.queue.wait_for_space(cancel).await
    }

    /// Queue one chunk. Fails with `QueueFull` if the queue has no room.
    pub fn decode(&self, chunk: EncodedChunk) -> PipelineResult<()> {
        self.check_usable()?;
        self.shared.queue.try_acquire()?;

        let mut inner = self.shared.inner.lock();
        let sent = self.send(Command::Decode {
            generation: inner.generation,
            chunk,
            queued_at: Instant::now(),
        });
        if let Err(err) = sent {
            self.shared.queue.release();
            return Err(err);
        }
        if matches!(inner.state, DecoderState::Configured) {
            inner.state = DecoderState::Decoding;
        }
        inner.stats.chunks_submitted += 1;
        Ok(())
    }

    /// Decode everything queued and emit every frame the decoder still
    /// holds. Fails with `Timeout` after the configured flush timeout.
    pub async fn flush(&self) -> PipelineResult<()> {
        self.check_usable()?;
        // Register the completion before the command can be processed.
        let (reply, done) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock();
            self.send(Command::Flush {
                generation: inner.generation,
                reply,
            })?;
            inner.state = DecoderState::Draining;
        }

        match tokio::time::timeout(self.settings.flush_timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PipelineError::Closed {
                component: "decoder",
            }),
            Err(_) => {
                warn!(timeout = ?self.settings.flush_timeout, "decoder flush timed out");
                Err(PipelineError::Timeout {
                    operation: "decoder flush",
                    after: self.settings.flush_timeout,
                })
            }
        }
    }

    /// Drop queued chunks and decoder state, failing current space waiters.
    /// The service returns to `Unconfigured`; use [`Self::reconfigure`].
    pub fn reset(&self) -> PipelineResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            if matches!(inner.state, DecoderState::Closed(None)) {
                return Err(PipelineError::Closed {
                    component: "decoder",
                });
            }
            if matches!(inner.state, DecoderState::Unconfigured) && self.shared.queue.in_flight() == 0 {
                return Ok(());
            }
            inner.generation += 1;
            inner.state = DecoderState::Unconfigured;
            inner.stats.resets += 1;
            self.shared.queue.reset(PipelineError::Closed {
                component: "decoder",
            });
            self.send(Command::Reset)?;
        }
        // Wait out a delivery that started before the generation bump.
        drop(self.shared.delivery.lock());
        debug!("Decoder reset");
        Ok(())
    }

    /// Stop the decode thread and fail every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if matches!(inner.state, DecoderState::Closed(None)) {
                return;
            }
            inner.generation += 1;
            inner.state = DecoderState::Closed(None);
        }
        self.shared.queue.fail(PipelineError::Closed {
            component: "decoder",
        });

        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("decoder thread panicked during shutdown");
            }
        }
        info!("Decoder closed");
    }

    pub fn stats(&self) -> DecoderStats {
        let inner = self.shared.inner.lock();
        let mut stats = inner.stats.clone();
        stats.state = inner.state.to_string();
        stats.queue_depth = self.shared.queue.in_flight();
        stats.peak_queue_depth = self.shared.queue.peak();
        stats
    }
}

impl Drop for DecoderService {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_loop(
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    mut output: FrameCallback,
    mut on_error: Option<ErrorCallback>,
) {
    let mut decoder: Option<Box<dyn VideoDecoder>> = None;
    let mut last_pts: Option<i64> = None;

    while let Ok(command) = commands.recv() {
        match command {
            Command::Install {
                generation,
                decoder: next,
            } => {
                if shared.is_current(generation) {
                    if let Some(mut old) = decoder.replace(next) {
                        old.reset();
                    }
                    last_pts = None;
                }
            }
            Command::Decode {
                generation,
                chunk,
                queued_at,
            } => {
                if !shared.is_current(generation) {
                    continue;
                }
                let result = match decoder.as_mut() {
                    Some(d) => d.decode(&chunk),
                    None => Err(PipelineError::decode("no decoder installed")),
                };
                if !shared.complete_chunk(generation, queued_at.elapsed()) {
                    continue;
                }
                match result {
                    Ok(images) => shared.deliver(generation, images, &mut last_pts, &mut output),
                    Err(err) => shared.record_error(generation, err, &mut on_error),
                }
            }
            Command::Flush { generation, reply } => {
                if !shared.is_current(generation) {
                    let _ = reply.send(Err(PipelineError::Closed {
                        component: "decoder",
                    }));
                    continue;
                }
                let result = match decoder.as_mut() {
                    Some(d) => d.flush(),
                    None => Ok(Vec::new()),
                };
                let outcome = match result {
                    Ok(images) => {
                        shared.deliver(generation, images, &mut last_pts, &mut output);
                        let mut inner = shared.inner.lock();
                        if inner.generation == generation && matches!(inner.state, DecoderState::Draining) {
                            inner.state = DecoderState::Configured;
                        }
                        Ok(())
                    }
                    Err(err) => {
                        shared.record_error(generation, err.clone(), &mut on_error);
                        Err(err)
                    }
                };
                let _ = reply.send(outcome);
            }
            Command::Reset => {
                if let Some(mut d) = decoder.take() {
                    d.reset();
                }
                last_pts = None;
            }
            Command::Shutdown => break,
        }
    }

    if let Some(mut d) = decoder.take() {
        d.reset();
    }
    debug!("decode thread exiting");
}
