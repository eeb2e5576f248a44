//! Export a recording to video.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio_util::sync::CancellationToken;

use grabme_common::config::ExportConfigFile;
use grabme_project_model::composite::{
    CompositeParams, CompositeSource, KeyframedComposite, StaticComposite,
};
use grabme_project_model::timeline::TrimRegion;
use grabme_project_model::viewport::Viewport;
use grabme_render_engine::{
    export_video, EncoderSink, ExportJob, ExportProgress, FfmpegEncoderSink, OutputFormat,
    ProgressCallback, RawMp4Sink,
};

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Recorded input video
    input: PathBuf,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format: mp4-h264, mp4-h265, gif, webm, raw-mp4
    #[arg(long)]
    format: Option<OutputFormat>,

    /// Output width (height follows the source aspect when omitted)
    #[arg(long)]
    width: Option<u32>,

    /// Output height
    #[arg(long)]
    height: Option<u32>,

    /// Output frame rate (defaults to the source rate)
    #[arg(long)]
    fps: Option<f64>,

    /// Start of the export on the trimmed timeline (seconds)
    #[arg(long)]
    start: Option<f64>,

    /// End of the export on the trimmed timeline (seconds)
    #[arg(long)]
    end: Option<f64>,

    /// Cut a source range, as START:END in seconds (repeatable)
    #[arg(long = "trim", value_parser = parse_trim)]
    trims: Vec<TrimRegion>,

    /// Fixed viewport as X,Y,W,H (normalized)
    #[arg(long, value_parser = parse_viewport)]
    viewport: Option<Viewport>,

    /// JSON file of `{time_ms, viewport}` keyframes
    #[arg(long)]
    viewport_keyframes: Option<PathBuf>,

    /// Padding around the video as a fraction of the shorter edge
    #[arg(long, default_value = "0.0")]
    padding: f64,

    /// Render worker threads (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,

    /// Render on one thread instead of the worker pool
    #[arg(long)]
    no_parallel: bool,

    /// Print the export report as JSON
    #[arg(long)]
    json: bool,
}

fn parse_trim(value: &str) -> Result<TrimRegion, String> {
    let (start, end) = value
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got '{value}'"))?;
    let start: f64 = start.trim().parse().map_err(|e| format!("bad trim start: {e}"))?;
    let end: f64 = end.trim().parse().map_err(|e| format!("bad trim end: {e}"))?;
    if end <= start {
        return Err(format!("trim end {end} must be after start {start}"));
    }
    Ok(TrimRegion::new(start * 1_000.0, end * 1_000.0))
}

fn parse_viewport(value: &str) -> Result<Viewport, String> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad viewport '{value}': {e}"))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Viewport::new(*x, *y, *w, *h)),
        _ => Err(format!("expected X,Y,W,H, got '{value}'")),
    }
}

pub async fn run(args: ExportArgs, config: &ExportConfigFile) -> anyhow::Result<()> {
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("export.mp4"));

    let mut job = ExportJob::new(&args.input, &output_path).with_config(config);
    if let Some(format) = args.format {
        job.format = format;
    }
    job.width = args.width;
    job.height = args.height;
    job.fps = args.fps;
    job.start_ms = args.start.map(|s| s * 1_000.0);
    job.end_ms = args.end.map(|s| s * 1_000.0);
    job.trims = args.trims.clone();
    if let Some(workers) = args.workers {
        job.pipeline.worker_count = workers;
    }
    if args.no_parallel {
        job.pipeline.parallel_render = false;
    }

    let base = CompositeParams {
        viewport: args.viewport.unwrap_or(Viewport::FULL),
        padding: args.padding,
        ..CompositeParams::default()
    };
    let composite: Arc<dyn CompositeSource> = match &args.viewport_keyframes {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read keyframes {}", path.display()))?;
            Arc::new(
                KeyframedComposite::from_json(base, &json)
                    .with_context(|| format!("Invalid keyframes in {}", path.display()))?,
            )
        }
        None => Arc::new(StaticComposite(base)),
    };

    println!("Exporting: {}", args.input.display());
    println!("  Output: {}", output_path.display());
    println!("  Format: {}", job.format);
    if !job.trims.is_empty() {
        println!("  Trims: {}", job.trims.len());
    }

    let mut sink: Box<dyn EncoderSink> = match job.format {
        OutputFormat::RawMp4 => Box::new(RawMp4Sink::new()),
        _ => Box::new(FfmpegEncoderSink::new()),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling export");
                cancel.cancel();
            }
        });
    }

    let progress_cb: ProgressCallback = Box::new(|p: ExportProgress| {
        print!(
            "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s)  ",
            p.progress * 100.0,
            p.frames_rendered,
            p.total_frames,
            p.eta_secs,
        );
        let _ = std::io::stdout().flush();
    });

    match export_video(&job, composite, sink.as_mut(), Some(progress_cb), &cancel).await {
        Ok(report) => {
            println!("\nExport complete: {}", output_path.display());
            println!(
                "  {} frames in {:.1}s ({} source, {:?} render)",
                report.frames_encoded, report.elapsed_secs, report.source_mode, report.render_mode
            );
            if let Some(reason) = &report.fast_path_error {
                println!("  Fast path skipped: {reason}");
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }
        Err(failure) if failure.is_cancelled() => {
            println!("\nExport cancelled.");
            Ok(())
        }
        Err(failure) => {
            println!();
            Err(failure.into())
        }
    }
}
