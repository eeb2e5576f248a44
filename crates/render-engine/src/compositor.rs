//! Frame compositor: crops the viewport out of a decoded frame, scales it
//! onto the output canvas, and draws the cursor highlight.
//!
//! The crop is fitted inside the padded canvas preserving its aspect
//! ratio; whatever it does not cover shows the background colour.

use std::sync::Arc;

use grabme_common::error::{PipelineError, PipelineResult};
use grabme_decode::RgbaImage;
use grabme_project_model::composite::{CompositeParams, CursorHighlight};
use grabme_project_model::viewport::{PixelRect, Viewport};

use crate::worker_pool::{renderer_factory, FrameRenderer, RenderTask, RendererFactory};

/// Largest padding fraction honoured; beyond it the video would vanish.
const MAX_PADDING: f64 = 0.45;

/// Where the cropped video lands on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    crop: PixelRect,
    dest: PixelRect,
}

/// CPU compositor producing `width x height` RGBA frames.
#[derive(Debug, Clone)]
pub struct Compositor {
    width: u32,
    height: u32,
}

impl Compositor {
    pub fn new(width: u32, height: u32) -> PipelineResult<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::config(format!(
                "output size must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// A factory handing each render worker its own compositor.
    pub fn factory(width: u32, height: u32) -> PipelineResult<Arc<dyn RendererFactory>> {
        let template = Self::new(width, height)?;
        Ok(renderer_factory(move || {
            Ok(Box::new(template.clone()) as Box<dyn FrameRenderer>)
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn placement(&self, source: &RgbaImage, params: &CompositeParams) -> Placement {
        let crop = params.viewport.pixel_rect(source.width(), source.height());

        let short_edge = self.width.min(self.height) as f64;
        let inset = (params.padding.clamp(0.0, MAX_PADDING) * short_edge).round() as u32;
        let inner_w = self.width.saturating_sub(inset * 2).max(1);
        let inner_h = self.height.saturating_sub(inset * 2).max(1);

        let scale = (inner_w as f64 / crop.width as f64).min(inner_h as f64 / crop.height as f64);
        let dest_w = ((crop.width as f64 * scale).round() as u32).clamp(1, inner_w);
        let dest_h = ((crop.height as f64 * scale).round() as u32).clamp(1, inner_h);
        let dest = PixelRect {
            x: (self.width - dest_w) / 2,
            y: (self.height - dest_h) / 2,
            width: dest_w,
            height: dest_h,
        };
        Placement { crop, dest }
    }

    /// Compose one output frame.
    pub fn compose(&self, source: &RgbaImage, params: &CompositeParams) -> PipelineResult<RgbaImage> {
        let mut canvas = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for _ in 0..(self.width as usize * self.height as usize) {
            canvas.extend_from_slice(&params.background);
        }

        let placement = self.placement(source, params);
        self.blit_scaled(&mut canvas, source, placement);
        if let Some(cursor) = &params.cursor {
            self.draw_cursor(&mut canvas, cursor, &params.viewport, placement.dest);
        }
        RgbaImage::new(self.width, self.height, canvas)
    }

    fn blit_scaled(&self, canvas: &mut [u8], source: &RgbaImage, placement: Placement) {
        let Placement { crop, dest } = placement;
        let step_x = crop.width as f64 / dest.width as f64;
        let step_y = crop.height as f64 / dest.height as f64;
        let stride = self.width as usize * 4;

        for dy in 0..dest.height {
            let sy = crop.y as f64 + (dy as f64 + 0.5) * step_y - 0.5;
            let row = (dest.y + dy) as usize * stride;
            for dx in 0..dest.width {
                let sx = crop.x as f64 + (dx as f64 + 0.5) * step_x - 0.5;
                let px = bilinear(source, crop, sx, sy);
                let offset = row + (dest.x + dx) as usize * 4;
                canvas[offset..offset + 4].copy_from_slice(&px);
            }
        }
    }

    fn draw_cursor(
        &self,
        canvas: &mut [u8],
        cursor: &CursorHighlight,
        viewport: &Viewport,
        dest: PixelRect,
    ) {
        // Off-screen cursors are not drawn.
        let Some((lx, ly)) = viewport.to_local(cursor.x, cursor.y) else {
            return;
        };
        let radius = cursor.radius * self.height as f64;
        if radius <= 0.0 {
            return;
        }
        let cx = dest.x as f64 + lx * dest.width as f64;
        let cy = dest.y as f64 + ly * dest.height as f64;

        let x0 = (cx - radius - 1.0).floor().max(0.0) as u32;
        let y0 = (cy - radius - 1.0).floor().max(0.0) as u32;
        let x1 = ((cx + radius + 1.0).ceil() as u32).min(self.width);
        let y1 = ((cy + radius + 1.0).ceil() as u32).min(self.height);
        let alpha = cursor.color[3] as f64 / 255.0;
        let stride = self.width as usize * 4;

        for y in y0..y1 {
            for x in x0..x1 {
                let dist = ((x as f64 + 0.5 - cx).powi(2) + (y as f64 + 0.5 - cy).powi(2)).sqrt();
                // One pixel of antialiasing at the rim.
                let coverage = (radius - dist + 0.5).clamp(0.0, 1.0) * alpha;
                if coverage <= 0.0 {
                    continue;
                }
                let offset = y as usize * stride + x as usize * 4;
                for channel in 0..3 {
                    let under = canvas[offset + channel] as f64;
                    let over = cursor.color[channel] as f64;
                    canvas[offset + channel] = (under + (over - under) * coverage).round() as u8;
                }
                canvas[offset + 3] = canvas[offset + 3].max((coverage * 255.0).round() as u8);
            }
        }
    }
}

/// Sample `source` at a fractional position, never reading outside `crop`.
fn bilinear(source: &RgbaImage, crop: PixelRect, sx: f64, sy: f64) -> [u8; 4] {
    let min_x = crop.x as f64;
    let min_y = crop.y as f64;
    let max_x = (crop.x + crop.width).saturating_sub(1) as f64;
    let max_y = (crop.y + crop.height).saturating_sub(1) as f64;
    let sx = sx.clamp(min_x, max_x);
    let sy = sy.clamp(min_y, max_y);
    let x0 = sx.floor();
    let y0 = sy.floor();
    let tx = sx - x0;
    let ty = sy - y0;
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);

    let p00 = source.pixel(x0 as u32, y0 as u32);
    let p10 = source.pixel(x1 as u32, y0 as u32);
    let p01 = source.pixel(x0 as u32, y1 as u32);
    let p11 = source.pixel(x1 as u32, y1 as u32);

    let mut out = [0u8; 4];
    for channel in 0..4 {
        let top = p00[channel] as f64 * (1.0 - tx) + p10[channel] as f64 * tx;
        let bottom = p01[channel] as f64 * (1.0 - tx) + p11[channel] as f64 * tx;
        out[channel] = (top * (1.0 - ty) + bottom * ty).round() as u8;
    }
    out
}

impl FrameRenderer for Compositor {
    fn render(&mut self, task: &RenderTask) -> PipelineResult<RgbaImage> {
        self.compose(task.frame.image(), &task.params)
    }
}
