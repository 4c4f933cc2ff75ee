// THEORY:
// The `colormap` module is a stateless utility that turns a normalized density
// into a display colour. It uses the classic "jet" ramp: dark blue for sparse
// areas through cyan and yellow to dark red for the densest cells.
//
// Each channel is a clipped triangle centred at a different point of [0,1]:
// blue peaks at 0.25, green at 0.5, red at 0.75.

pub mod colormap {
    /// An 8-bit RGB triple.
    pub type Rgb = [u8; 3];

    /// Maps `v` in [0,1] onto the jet ramp. Values outside the range are clamped.
    pub fn jet(v: f64) -> Rgb {
        let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        [
            channel(1.5 - (4.0 * v - 3.0).abs()),
            channel(1.5 - (4.0 * v - 2.0).abs()),
            channel(1.5 - (4.0 * v - 1.0).abs()),
        ]
    }

    fn channel(intensity: f64) -> u8 {
        (intensity.clamp(0.0, 1.0) * 255.0).floor() as u8
    }
}
