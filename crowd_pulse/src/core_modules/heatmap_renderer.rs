// THEORY:
// The `HeatmapRenderer` rasterizes a density grid into an RGBA overlay that can
// be composited over the video: one filled rectangle
// per visible cell, coloured with the jet ramp, followed by a Gaussian blur and
// a brightness lift so the hard cell edges melt into smooth, glowing blobs.
//
// Key architectural principles:
// 1.  **Normalize Against A Safe Maximum**: Every cell is divided by the frame's
//     `max_density` (floored so it is never zero) and clamped into [0,1].
// 2.  **Skip The Noise**: Cells below the noise floor are not drawn at all.
// 3.  **Stateless**: The renderer holds only settings. Temporal smoothing lives in
//     the `TemporalSmoother`; the visibility flag lives in `HeatmapView`.

use crate::core_modules::colormap::colormap;
use crate::core_modules::density_frame::{GridShape, floor_max_density};
use image::{Rgba, RgbaImage, imageops};
use serde::{Deserialize, Serialize};

/// Tunable rasterization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Normalized values below this are treated as empty.
    pub noise_floor: f64,
    /// Gaussian blur sigma in pixels. Zero disables the blur.
    pub blur_sigma: f32,
    /// Multiplier applied to the colour channels after blurring.
    pub brightness: f32,
    /// Alpha of a fully opaque cell before the view's opacity is applied.
    pub cell_alpha: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 600,
            height: 400,
            noise_floor: 0.1,
            blur_sigma: 15.0,
            brightness: 2.5,
            cell_alpha: 0.9,
        }
    }
}

/// Normalizes one cell for display.
pub fn normalize_cell(value: f64, max_density: f64) -> f64 {
    (value / floor_max_density(max_density)).clamp(0.0, 1.0)
}

/// Turns density grids into RGBA overlays.
#[derive(Debug, Clone, Default)]
pub struct HeatmapRenderer {
    settings: RenderSettings,
}

impl HeatmapRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Renders `grid` into a new overlay. `opacity` scales every cell's alpha.
    pub fn render(
        &self,
        grid: &[f64],
        shape: GridShape,
        max_density: f64,
        opacity: f64,
    ) -> RgbaImage {
        let RenderSettings {
            width,
            height,
            noise_floor,
            blur_sigma,
            brightness,
            cell_alpha,
        } = self.settings;
        let mut canvas = RgbaImage::new(width, height);
        if shape.is_empty() || grid.len() != shape.len() || width == 0 || height == 0 {
            return canvas;
        }

        let alpha = ((cell_alpha * opacity.clamp(0.0, 1.0)) * 255.0).round() as u8;
        let cell_w = width as f64 / shape.cols as f64;
        let cell_h = height as f64 / shape.rows as f64;

        // --- 1. Paint Cells ---
        for (i, value) in grid.iter().enumerate() {
            let norm = normalize_cell(*value, max_density);
            if norm < noise_floor {
                continue;
            }
            let [r, g, b] = colormap::jet(norm);
            let col = (i % shape.cols) as f64;
            let row = (i / shape.cols) as f64;

            // Cells overlap their neighbours by a couple of pixels to avoid seams.
            let x0 = (col * cell_w).floor() as u32;
            let y0 = (row * cell_h).floor() as u32;
            let x1 = (((col + 1.0) * cell_w).ceil() as u32 + 2).min(width);
            let y1 = (((row + 1.0) * cell_h).ceil() as u32 + 2).min(height);
            for y in y0..y1 {
                for x in x0..x1 {
                    canvas.put_pixel(x, y, Rgba([r, g, b, alpha]));
                }
            }
        }

        // --- 2. Post-Process ---
        let mut canvas = if blur_sigma > 0.0 {
            imageops::blur(&canvas, blur_sigma)
        } else {
            canvas
        };
        if brightness != 1.0 {
            for pixel in canvas.pixels_mut() {
                for channel in pixel.0.iter_mut().take(3) {
                    *channel = (*channel as f32 * brightness).clamp(0.0, 255.0) as u8;
                }
            }
        }
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crisp() -> HeatmapRenderer {
        HeatmapRenderer::new(RenderSettings {
            width: 40,
            height: 20,
            blur_sigma: 0.0,
            brightness: 1.0,
            ..RenderSettings::default()
        })
    }

    #[test]
    fn cells_below_the_noise_floor_are_not_drawn() {
        let shape = GridShape::new(4, 2);
        let mut grid = vec![0.05; shape.len()];
        grid[0] = 1.0;
        let image = crisp().render(&grid, shape, 1.0, 1.0);

        assert_eq!(image.get_pixel(1, 1).0, [127, 0, 0, 230]);
        // The last cell is well clear of the first one's overlap.
        assert_eq!(image.get_pixel(39, 19).0[3], 0);
    }

    #[test]
    fn opacity_scales_alpha() {
        let shape = GridShape::new(1, 1);
        let image = crisp().render(&[1.0], shape, 1.0, 0.5);
        assert_eq!(image.get_pixel(0, 0).0[3], 115);
    }

    #[test]
    fn zero_maximum_does_not_divide_by_zero() {
        let shape = GridShape::new(2, 1);
        let image = crisp().render(&[0.0, 0.0], shape, 0.0, 1.0);
        assert!(image.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn blur_and_brightness_spread_the_glow() {
        let renderer = HeatmapRenderer::new(RenderSettings {
            width: 30,
            height: 30,
            blur_sigma: 2.0,
            ..RenderSettings::default()
        });
        let shape = GridShape::new(3, 3);
        let mut grid = vec![0.0; shape.len()];
        grid[4] = 1.0;
        let image = renderer.render(&grid, shape, 1.0, 1.0);
        // The blur bleeds some alpha into the otherwise empty corner cell.
        assert!(image.get_pixel(8, 8).0[3] > 0);
    }
}
