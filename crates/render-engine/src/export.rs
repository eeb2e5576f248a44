//! Export configuration and job management.
//!
//! [`export_video`] drives one job end to end: open the frame source,
//! plan the output frames, render through the coordinator, and feed the
//! ordered result into an [`EncoderSink`]. Frames in flight between the
//! source request and the encoder are bounded by the encode queue, which
//! is taken before a frame is requested and returned once the sink has
//! accepted it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use grabme_common::clock::{ExportClock, FrameTimebase, RateController};
use grabme_common::config::{EncoderDefaults, ExportConfigFile, PipelineConfig};
use grabme_common::error::{PipelineError, PipelineResult};
use grabme_project_model::composite::CompositeSource;
use grabme_project_model::timeline::{TimeRemap, TrimRegion};

use crate::compositor::Compositor;
use crate::coordinator::{CoordinatorStats, RenderCoordinator, RenderMode};
use crate::encode_queue::{EncodeQueue, EncodeQueueStats};
use crate::sink::{EncoderSettings, EncoderSink, OutputFormat, SinkSummary};
use crate::source::{open_frame_source, FrameSource, SourceCapabilities, SourceMode, SourceOptions};

/// Progress callbacks per second while rendering.
const PROGRESS_HZ: u32 = 10;

/// An export job ready to be rendered.
#[derive(Debug, Clone)]
pub struct ExportJob {
    /// Recorded input video.
    pub input_path: PathBuf,

    /// Output file path.
    pub output_path: PathBuf,

    pub format: OutputFormat,

    /// Output size; missing dimensions follow the source aspect ratio.
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Output frame rate; defaults to the source rate.
    pub fps: Option<f64>,

    /// Start of the exported range on the effective timeline.
    pub start_ms: Option<f64>,

    /// End of the exported range on the effective timeline.
    pub end_ms: Option<f64>,

    /// Source-time regions removed from the export.
    pub trims: Vec<TrimRegion>,

    pub pipeline: PipelineConfig,
    pub encoder: EncoderDefaults,
}

impl ExportJob {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        let output_path = output_path.into();
        Self {
            format: OutputFormat::from_path(&output_path).unwrap_or_default(),
            input_path: input_path.into(),
            output_path,
            width: None,
            height: None,
            fps: None,
            start_ms: None,
            end_ms: None,
            trims: Vec::new(),
            pipeline: PipelineConfig::default(),
            encoder: EncoderDefaults::default(),
        }
    }

    /// Take pipeline and encoder settings from a loaded config file.
    pub fn with_config(mut self, config: &ExportConfigFile) -> Self {
        self.pipeline = config.pipeline.clone();
        self.encoder = config.encoder.clone();
        self
    }

    pub fn remap(&self) -> PipelineResult<TimeRemap> {
        TimeRemap::new(self.trims.clone())
    }

    /// Default frame source options for this job.
    pub fn source_options(&self) -> PipelineResult<SourceOptions> {
        Ok(SourceOptions::new(self.pipeline.clone(), self.remap()?))
    }
}

/// Progress callback for export rendering.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send + Sync>;

/// Export progress report.
#[derive(Debug, Clone, Serialize)]
pub struct ExportProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames handed to the encoder so far.
    pub frames_rendered: u64,

    /// Total frames to render.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    /// Current stage.
    pub stage: ExportStage,
}

/// Stages of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStage {
    Preparing,
    Rendering,
    Encoding,
    Finalizing,
    Complete,
    Failed,
}

/// Output frames of one job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExportPlan {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Effective time of output frame 0.
    pub start_ms: f64,
    pub duration_ms: f64,
    pub total_frames: u64,
}

impl ExportPlan {
    /// Effective time shown at output frame `index`.
    pub fn frame_time_ms(&self, index: u64) -> f64 {
        self.start_ms + FrameTimebase::new(self.fps).index_to_ms(index)
    }
}

/// Work out output size, rate, and frame count.
pub fn plan_export(
    job: &ExportJob,
    capabilities: &SourceCapabilities,
    remap: &TimeRemap,
) -> PipelineResult<ExportPlan> {
    let effective_total = remap.effective_duration(capabilities.duration_ms);
    let start_ms = job.start_ms.unwrap_or(0.0).clamp(0.0, effective_total);
    let end_ms = job.end_ms.unwrap_or(effective_total).min(effective_total);
    if end_ms <= start_ms {
        return Err(PipelineError::config(format!(
            "export range [{start_ms:.1}, {end_ms:.1}) ms is empty (effective duration {effective_total:.1} ms)"
        )));
    }

    let fps = job.fps.unwrap_or(capabilities.fps);
    if !fps.is_finite() || fps <= 0.0 {
        return Err(PipelineError::config(format!("invalid output frame rate {fps}")));
    }

    let (width, height) = output_size(job, capabilities);
    let duration_ms = end_ms - start_ms;
    Ok(ExportPlan {
        width,
        height,
        fps,
        start_ms,
        duration_ms,
        total_frames: FrameTimebase::new(fps).frames_in(duration_ms).max(1),
    })
}

fn output_size(job: &ExportJob, capabilities: &SourceCapabilities) -> (u32, u32) {
    let aspect = capabilities.width as f64 / capabilities.height.max(1) as f64;
    let (width, height) = match (job.width, job.height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, (w as f64 / aspect).round() as u32),
        (None, Some(h)) => ((h as f64 * aspect).round() as u32, h),
        (None, None) => (capabilities.width, capabilities.height),
    };
    // 4:2:0 encoders need even dimensions.
    let even = |v: u32| if v > 1 { v & !1 } else { v.max(1) };
    match job.format {
        OutputFormat::Mp4H264 | OutputFormat::Mp4H265 | OutputFormat::Webm => {
            (even(width), even(height))
        }
        OutputFormat::Gif | OutputFormat::RawMp4 => (width.max(1), height.max(1)),
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub output_path: PathBuf,
    pub source_mode: SourceMode,
    pub render_mode: RenderMode,
    /// Why the fast path was not used, when it was not.
    pub fast_path_error: Option<String>,
    pub plan: ExportPlan,
    pub frames_encoded: u64,
    pub elapsed_secs: f64,
    pub started_at: String,
    pub sink: SinkSummary,
    pub coordinator: CoordinatorStats,
    pub encode_queue: EncodeQueueStats,
}

/// A failed export. Nothing partial is handed back.
#[derive(Debug, thiserror::Error)]
#[error("export failed while {stage:?} ({}): {error}", mode_label(.mode))]
pub struct ExportFailure {
    pub stage: ExportStage,
    pub mode: Option<SourceMode>,
    #[source]
    pub error: PipelineError,
}

fn mode_label(mode: &Option<SourceMode>) -> String {
    mode.map_or_else(|| "no source".to_string(), |m| m.to_string())
}

impl ExportFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, PipelineError::Cancelled)
    }
}

struct ProgressReporter {
    callback: Option<ProgressCallback>,
    rate: RateController,
    clock: ExportClock,
    total_frames: u64,
}

impl ProgressReporter {
    fn report(&self, stage: ExportStage, done: u64) {
        if let Some(cb) = &self.callback {
            let progress = if self.total_frames == 0 {
                0.0
            } else {
                (done as f64 / self.total_frames as f64).clamp(0.0, 1.0)
            };
            cb(ExportProgress {
                progress: if stage == ExportStage::Complete { 1.0 } else { progress },
                frames_rendered: done,
                total_frames: self.total_frames,
                eta_secs: self.clock.eta_secs(done, self.total_frames),
                stage,
            });
        }
    }

    fn tick(&mut self, done: u64) {
        if self.callback.is_some() && self.rate.should_tick(Instant::now()) {
            self.report(ExportStage::Rendering, done);
        }
    }
}

/// Export `job.input_path` into `sink` with the default source options.
pub async fn export_video(
    job: &ExportJob,
    composite: Arc<dyn CompositeSource>,
    sink: &mut dyn EncoderSink,
    progress: Option<ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<ExportReport, ExportFailure> {
    let options = job.source_options().map_err(|error| ExportFailure {
        stage: ExportStage::Preparing,
        mode: None,
        error,
    })?;
    export_video_with(job, options, composite, sink, progress, cancel).await
}

/// Export with explicit frame source options (decoder registry,
/// extractor, frame accounting).
pub async fn export_video_with(
    job: &ExportJob,
    options: SourceOptions,
    composite: Arc<dyn CompositeSource>,
    sink: &mut dyn EncoderSink,
    progress: Option<ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<ExportReport, ExportFailure> {
    let clock = ExportClock::start();
    let mut reporter = ProgressReporter {
        callback: progress,
        rate: RateController::new(PROGRESS_HZ),
        clock: clock.clone(),
        total_frames: 0,
    };
    let fail = |stage: ExportStage, mode: Option<SourceMode>| {
        move |error: PipelineError| ExportFailure { stage, mode, error }
    };

    info!(
        input = %job.input_path.display(),
        output = %job.output_path.display(),
        format = %job.format,
        "Starting export"
    );
    reporter.report(ExportStage::Preparing, 0);

    job.pipeline
        .validate()
        .map_err(fail(ExportStage::Preparing, None))?;
    if cancel.is_cancelled() {
        return Err(fail(ExportStage::Preparing, None)(PipelineError::Cancelled));
    }

    let remap = options.remap.clone();
    let opened = open_frame_source(&job.input_path, options)
        .await
        .map_err(fail(ExportStage::Preparing, None))?;
    let mode = opened.capabilities.mode;
    let fast_path_error = opened.fast_path_error.as_ref().map(ToString::to_string);
    let source: Arc<dyn FrameSource> = Arc::from(opened.source);

    let plan = match plan_export(job, &opened.capabilities, &remap) {
        Ok(plan) => plan,
        Err(err) => {
            source.destroy();
            return Err(fail(ExportStage::Preparing, Some(mode))(err));
        }
    };
    reporter.total_frames = plan.total_frames;
    info!(
        source_mode = %mode,
        width = plan.width,
        height = plan.height,
        fps = plan.fps,
        frames = plan.total_frames,
        "Export planned"
    );

    let factory = match Compositor::factory(plan.width, plan.height) {
        Ok(factory) => factory,
        Err(err) => {
            source.destroy();
            return Err(fail(ExportStage::Preparing, Some(mode))(err));
        }
    };
    let coordinator = Arc::new(
        RenderCoordinator::new(source, composite, factory, &job.pipeline, cancel).await,
    );

    let settings = EncoderSettings::new(
        job.output_path.clone(),
        job.format,
        plan.width,
        plan.height,
        plan.fps,
        &job.encoder,
    );
    if let Err(err) = sink.start(&settings).await {
        coordinator.destroy().await;
        reporter.report(ExportStage::Failed, 0);
        return Err(fail(ExportStage::Preparing, Some(mode))(err));
    }

    let encode_queue = Arc::new(EncodeQueue::new(job.pipeline.encode_queue_size));
    let outcome = run_frames(
        &coordinator,
        &encode_queue,
        &plan,
        sink,
        &mut reporter,
        job.pipeline.effective_workers() * 2,
        cancel,
    )
    .await;

    let frames_encoded = match outcome {
        Ok(frames) => frames,
        Err((stage, err)) => {
            error!(stage = ?stage, error = %err, "Export failed");
            encode_queue.close(err.clone());
            sink.abort().await;
            coordinator.destroy().await;
            reporter.report(ExportStage::Failed, 0);
            return Err(fail(stage, Some(mode))(err));
        }
    };

    reporter.report(ExportStage::Finalizing, frames_encoded);
    let summary = match sink.finish().await {
        Ok(summary) => summary,
        Err(err) => {
            error!(error = %err, "Encoder failed to finalize");
            sink.abort().await;
            coordinator.destroy().await;
            reporter.report(ExportStage::Failed, frames_encoded);
            return Err(fail(ExportStage::Finalizing, Some(mode))(err));
        }
    };

    let coordinator_stats = coordinator.stats();
    coordinator.destroy().await;
    reporter.report(ExportStage::Complete, frames_encoded);

    let report = ExportReport {
        output_path: job.output_path.clone(),
        source_mode: mode,
        render_mode: coordinator_stats.mode,
        fast_path_error,
        plan,
        frames_encoded,
        elapsed_secs: clock.elapsed_secs(),
        started_at: clock.epoch_wall().to_string(),
        sink: summary,
        coordinator: coordinator_stats,
        encode_queue: encode_queue.stats(),
    };
    info!(
        frames = report.frames_encoded,
        elapsed_secs = report.elapsed_secs,
        source_mode = %report.source_mode,
        render_mode = ?report.render_mode,
        "Export complete"
    );
    Ok(report)
}

type StageResult<T> = Result<T, (ExportStage, PipelineError)>;

/// Produce every output frame and encode the ordered stream.
async fn run_frames(
    coordinator: &Arc<RenderCoordinator>,
    encode_queue: &Arc<EncodeQueue>,
    plan: &ExportPlan,
    sink: &mut dyn EncoderSink,
    reporter: &mut ProgressReporter,
    window: usize,
    cancel: &CancellationToken,
) -> StageResult<u64> {
    let mut output = coordinator.take_output().ok_or((
        ExportStage::Rendering,
        PipelineError::Closed {
            component: "render output",
        },
    ))?;

    let producer = async {
        let rendering = |err: PipelineError| (ExportStage::Rendering, err);
        let mut in_flight: JoinSet<PipelineResult<()>> = JoinSet::new();
        let result: PipelineResult<()> = async {
            for index in 0..plan.total_frames {
                encode_queue.wait_for_space(cancel).await?;
                encode_queue.enqueue()?;
                let task = coordinator
                    .prepare_task(index, plan.frame_time_ms(index))
                    .await?;
                let coordinator = Arc::clone(coordinator);
                in_flight.spawn(async move { coordinator.submit_task(task).await });
                while in_flight.len() >= window.max(1) {
                    join_one(&mut in_flight).await?;
                }
            }
            while !in_flight.is_empty() {
                join_one(&mut in_flight).await?;
            }
            coordinator.finish()?;
            Ok(())
        }
        .await;
        if result.is_err() {
            // Unblocks the consumer, which would otherwise wait for frames
            // that will never arrive.
            coordinator.cancel();
        }
        result.map_err(rendering)
    };

    let consumer = async {
        let encoding = |err: PipelineError| (ExportStage::Encoding, err);
        let mut encoded = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(encoding(PipelineError::Cancelled)),
                next = output.recv() => next,
            };
            let Some((index, result)) = next else {
                break;
            };
            let started = Instant::now();
            if let Err(err) = sink.encode(index, result.image).await {
                encode_queue.close(err.clone());
                return Err(encoding(err));
            }
            encode_queue.complete(started.elapsed());
            encoded += 1;
            reporter.tick(encoded);
        }
        debug!(encoded, "Ordered output drained");
        Ok(encoded)
    };

    let ((), encoded) = tokio::try_join!(producer, consumer)?;
    if encoded != plan.total_frames {
        return Err((
            ExportStage::Encoding,
            PipelineError::encode(format!(
                "encoded {encoded} of {} planned frames",
                plan.total_frames
            )),
        ));
    }
    Ok(encoded)
}

async fn join_one(in_flight: &mut JoinSet<PipelineResult<()>>) -> PipelineResult<()> {
    match in_flight.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(err)) => Err(anyhow::anyhow!("render task failed: {err}").into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(width: u32, height: u32, fps: f64, duration_ms: f64) -> SourceCapabilities {
        SourceCapabilities {
            mode: SourceMode::Fast,
            width,
            height,
            fps,
            duration_ms,
            frame_count: FrameTimebase::new(fps).frames_in(duration_ms),
            codec: "raw".to_string(),
        }
    }

    #[test]
    fn test_plan_uses_source_rate_and_size() {
        let job = ExportJob::new("in.mp4", "out.mp4");
        let plan = plan_export(&job, &capabilities(1920, 1080, 30.0, 2_000.0), &TimeRemap::identity())
            .unwrap();
        assert_eq!((plan.width, plan.height), (1920, 1080));
        assert_eq!(plan.total_frames, 60);
        assert!((plan.frame_time_ms(30) - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_applies_trims_and_range() {
        let mut job = ExportJob::new("in.mp4", "out.gif");
        job.trims = vec![TrimRegion::new(500.0, 1_500.0)];
        job.start_ms = Some(250.0);
        job.fps = Some(10.0);
        let remap = job.remap().unwrap();
        let plan = plan_export(&job, &capabilities(640, 480, 30.0, 3_000.0), &remap).unwrap();
        // 2000 ms effective, minus the 250 ms start offset.
        assert!((plan.duration_ms - 1_750.0).abs() < 1e-9);
        assert_eq!(plan.total_frames, 18);
        assert_eq!(job.format, OutputFormat::Gif);
    }

    #[test]
    fn test_plan_keeps_aspect_and_even_size() {
        let mut job = ExportJob::new("in.mp4", "out.mp4");
        job.width = Some(641);
        let plan = plan_export(&job, &capabilities(1280, 720, 30.0, 1_000.0), &TimeRemap::identity())
            .unwrap();
        assert_eq!((plan.width, plan.height), (640, 360));
    }

    #[test]
    fn test_plan_rejects_empty_range() {
        let mut job = ExportJob::new("in.mp4", "out.mp4");
        job.start_ms = Some(5_000.0);
        let err = plan_export(&job, &capabilities(64, 64, 30.0, 1_000.0), &TimeRemap::identity())
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_failure_message_names_stage_and_mode() {
        let failure = ExportFailure {
            stage: ExportStage::Rendering,
            mode: Some(SourceMode::Fallback),
            error: PipelineError::Cancelled,
        };
        let message = failure.to_string();
        assert!(message.contains("Rendering"));
        assert!(message.contains("fallback"));
        assert!(failure.is_cancelled());
    }
}
