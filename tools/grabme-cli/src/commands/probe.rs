//! Show container and codec details of a recording.

use std::path::PathBuf;

use grabme_decode::DecoderRegistry;
use grabme_demux::{CodecProbe, Demuxer};
use grabme_render_engine::{FfmpegSeekExtractor, FrameExtractor};

pub async fn run(input: PathBuf, json: bool) -> anyhow::Result<()> {
    let registry = DecoderRegistry::with_defaults();
    let mut demuxer = Demuxer::open(&input)?;

    match demuxer.initialize() {
        Ok(info) => {
            let decodable = registry.supports(&info.decoder_config);
            demuxer.destroy();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }
            println!("Recording: {}", input.display());
            println!("  Container: {}", info.brand.as_deref().unwrap_or("mp4"));
            println!(
                "  Codec: {} ({})",
                info.decoder_config.codec, info.decoder_config.codec_string
            );
            println!("  Resolution: {}x{} @ {:.3}fps", info.width, info.height, info.fps);
            println!("  Duration: {:.2}s", info.duration_ms / 1_000.0);
            println!(
                "  Frames: {} ({} keyframes)",
                info.frame_count, info.keyframe_count
            );
            let path = if decodable {
                "fast"
            } else {
                "fallback (no decoder backend accepts this codec)"
            };
            println!("  Export path: {path}");
            Ok(())
        }
        Err(err) => {
            demuxer.destroy();
            tracing::warn!(error = %err, "Demuxer cannot read input, asking ffprobe");
            let probe = FfmpegSeekExtractor::default().probe(&input).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&probe)?);
                return Ok(());
            }
            println!("Recording: {}", input.display());
            println!("  Codec: {}", probe.codec);
            println!("  Resolution: {}x{} @ {:.3}fps", probe.width, probe.height, probe.fps);
            println!("  Duration: {:.2}s", probe.duration_ms / 1_000.0);
            println!("  Frames: {}", probe.frame_count);
            println!("  Export path: fallback ({err})");
            Ok(())
        }
    }
}
