//! Write a synthetic raw-video recording.

use std::path::PathBuf;

use grabme_demux::RawMp4Writer;

/// Side of the moving square, as a fraction of the height.
const SQUARE: f64 = 0.2;

pub fn run(output: PathBuf, width: u32, height: u32, fps: u32, seconds: f64) -> anyhow::Result<()> {
    if fps == 0 || seconds <= 0.0 {
        anyhow::bail!("fps and duration must be positive");
    }
    let frames = (seconds * fps as f64).round().max(1.0) as u32;
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = RawMp4Writer::create(&output, width, height, fps)?;
    let mut rgb = vec![0u8; writer.frame_size()];
    for index in 0..frames {
        draw_frame(&mut rgb, width, height, index as f64 / frames as f64);
        writer.write_frame(&rgb)?;
    }
    writer.finish()?;

    println!(
        "Wrote {} ({}x{} @ {}fps, {} frames)",
        output.display(),
        width,
        height,
        fps,
        frames
    );
    Ok(())
}

/// Horizontal gradient with a white square crossing left to right.
fn draw_frame(rgb: &mut [u8], width: u32, height: u32, t: f64) {
    let side = ((height as f64 * SQUARE) as u32).max(1);
    let travel = width.saturating_sub(side) as f64;
    let sx = (travel * t) as u32;
    let sy = (height - side.min(height)) / 2;

    for y in 0..height {
        for x in 0..width {
            let offset = (y as usize * width as usize + x as usize) * 3;
            let inside = x >= sx && x < sx + side && y >= sy && y < sy + side;
            let px = if inside {
                [255, 255, 255]
            } else {
                let shade = (x * 255 / width.max(1)) as u8;
                [shade, 64, 255 - shade]
            };
            rgb[offset..offset + 3].copy_from_slice(&px);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_moves_right() {
        let (w, h) = (40, 20);
        let mut first = vec![0u8; (w * h * 3) as usize];
        let mut later = first.clone();
        draw_frame(&mut first, w, h, 0.0);
        draw_frame(&mut later, w, h, 0.5);
        let white_at = |rgb: &[u8], x: u32| {
            let offset = ((h / 2 * w + x) * 3) as usize;
            rgb[offset..offset + 3] == [255, 255, 255]
        };
        assert!(white_at(&first, 0));
        assert!(!white_at(&later, 0));
        assert!(white_at(&later, 20));
    }
}
