// THEORY:
// `HeatmapView` is the per-refresh half of the render loop. It owns the
// `TemporalSmoother` and the `HeatmapRenderer` together with the operator's
// display toggles. Every refresh it moves the displayed grid toward the latest
// boosted target, and only then decides whether to draw.
//
// Smoothing always advances, even while the overlay is hidden or disabled.
// Turning the overlay back on therefore shows the current state immediately,
// without a visible jump from a stale picture.

use crate::core_modules::density_frame::GridShape;
use crate::core_modules::heatmap_renderer::{HeatmapRenderer, RenderSettings};
use crate::core_modules::smoother::TemporalSmoother;
use image::RgbaImage;

/// Smoothing state plus display toggles for the live heatmap.
#[derive(Debug, Clone)]
pub struct HeatmapView {
    smoother: TemporalSmoother,
    renderer: HeatmapRenderer,
    /// Operator's show/hide toggle.
    visible: bool,
    /// Master switch for the overlay.
    enabled: bool,
    /// Overlay opacity in [0,1].
    opacity: f64,
}

impl HeatmapView {
    pub fn new(alpha: f64, settings: RenderSettings) -> Self {
        Self {
            smoother: TemporalSmoother::new(alpha),
            renderer: HeatmapRenderer::new(settings),
            visible: true,
            enabled: true,
            opacity: 1.0,
        }
    }

    /// One refresh: smooth toward `target`, then draw if the overlay is shown.
    pub fn advance(
        &mut self,
        target: &[f64],
        shape: GridShape,
        max_density: f64,
    ) -> Option<RgbaImage> {
        let drawing = self.is_drawing();
        let displayed = self.smoother.step(target);
        if !drawing {
            return None;
        }
        Some(
            self.renderer
                .render(displayed, shape, max_density, self.opacity),
        )
    }

    /// True when the next refresh produces an overlay.
    pub fn is_drawing(&self) -> bool {
        self.visible && self.enabled
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_opacity(&mut self, opacity: f64) {
        self.opacity = if opacity.is_finite() {
            opacity.clamp(0.0, 1.0)
        } else {
            1.0
        };
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    /// The grid currently on screen, if any target has been seen.
    pub fn displayed(&self) -> Option<&[f64]> {
        self.smoother.displayed()
    }

    pub fn reset(&mut self) {
        self.smoother.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> HeatmapView {
        HeatmapView::new(
            0.5,
            RenderSettings {
                width: 8,
                height: 8,
                blur_sigma: 0.0,
                ..RenderSettings::default()
            },
        )
    }

    #[test]
    fn hidden_view_keeps_smoothing() {
        let shape = GridShape::new(2, 2);
        let mut view = view();
        assert!(view.advance(&[0.0; 4], shape, 1.0).is_some());

        view.set_visible(false);
        assert!(view.advance(&[1.0; 4], shape, 1.0).is_none());
        assert!(view.advance(&[1.0; 4], shape, 1.0).is_none());
        assert_eq!(view.displayed().unwrap(), &[0.75; 4]);

        // Showing it again continues from where smoothing got to.
        view.set_visible(true);
        assert!(view.advance(&[1.0; 4], shape, 1.0).is_some());
        assert_eq!(view.displayed().unwrap(), &[0.875; 4]);
    }

    #[test]
    fn disabled_view_does_not_draw() {
        let shape = GridShape::new(2, 2);
        let mut view = view();
        view.set_enabled(false);
        assert!(view.advance(&[1.0; 4], shape, 1.0).is_none());
        assert!(!view.is_drawing());
    }

    #[test]
    fn opacity_is_clamped() {
        let mut view = view();
        view.set_opacity(4.0);
        assert_eq!(view.opacity(), 1.0);
        view.set_opacity(-1.0);
        assert_eq!(view.opacity(), 0.0);
    }
}
