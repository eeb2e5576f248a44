//! Check external tools, decoders, and the config file.

use std::path::Path;

use grabme_common::config::{config_file_path, ExportConfigFile};
use grabme_decode::{command_exists, DecoderRegistry};

pub fn run(config: &ExportConfigFile, config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("GrabMe Export Check");
    println!("{}", "=".repeat(50));

    let mut ready = true;
    for (tool, role) in [
        ("ffmpeg", "encoding, fallback frame extraction, H.264/HEVC decoding"),
        ("ffprobe", "fallback media probing"),
    ] {
        if command_exists(tool) {
            println!("[OK] {tool}: found ({role})");
        } else {
            ready = false;
            println!("[WARN] {tool}: not found in PATH ({role})");
        }
    }

    let registry = DecoderRegistry::with_defaults();
    println!("[OK] Decoder backends: {}", registry.backend_names().join(", "));

    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config_file_path);
    let source = if path.exists() { "loaded" } else { "defaults" };
    println!("[OK] Config: {} ({source})", path.display());
    match config.pipeline.validate() {
        Ok(()) => {
            let p = &config.pipeline;
            println!(
                "     workers {} (parallel: {}), frame buffer {}, decoder queue {}, reassembly {}, encode queue {}",
                p.effective_workers(),
                p.parallel_render,
                p.frame_buffer_capacity,
                p.decoder_queue_size,
                p.reassembly_capacity,
                p.encode_queue_size
            );
        }
        Err(err) => {
            ready = false;
            println!("[WARN] Config invalid: {err}");
        }
    }

    println!();
    if ready {
        println!("All export paths are available.");
    } else {
        println!("Only raw MP4 export is available without the missing tools.");
    }
    Ok(())
}
