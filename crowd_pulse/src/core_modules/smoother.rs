// THEORY:
// The `TemporalSmoother` is what keeps the heatmap from flickering. Upstream
// frames arrive in bursts and at an irregular rate; the display refreshes at a
// steady one. Instead of snapping to every new target, the displayed grid moves
// a fixed fraction `alpha` of the way toward the latest target on every refresh.
// That is an exponential moving average: noise is damped, and at 30 refreshes a
// second with alpha = 0.1 the display settles in about a second.
//
// The smoother only ever moves toward its target, so for a constant target the
// distance shrinks by a factor of (1 - alpha) on every step.

pub const DEFAULT_SMOOTHING_ALPHA: f64 = 0.1;

/// Exponential smoother for a flat grid.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    alpha: f64,
    /// The grid currently on screen. `None` until the first target arrives.
    displayed: Option<Vec<f64>>,
}

impl TemporalSmoother {
    /// `alpha` is clamped into (0, 1].
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            DEFAULT_SMOOTHING_ALPHA
        };
        Self {
            alpha,
            displayed: None,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Moves the displayed grid one step toward `target` and returns it.
    /// The first target (or a target of a different size) is adopted directly.
    pub fn step(&mut self, target: &[f64]) -> &[f64] {
        let alpha = self.alpha;
        let displayed = match self.displayed.take() {
            Some(mut displayed) if displayed.len() == target.len() => {
                for (current, goal) in displayed.iter_mut().zip(target) {
                    *current += (goal - *current) * alpha;
                }
                displayed
            }
            _ => target.to_vec(),
        };
        self.displayed.insert(displayed)
    }

    pub fn displayed(&self) -> Option<&[f64]> {
        self.displayed.as_deref()
    }

    pub fn reset(&mut self) {
        self.displayed = None;
    }
}

impl Default for TemporalSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn first_target_is_adopted() {
        let mut smoother = TemporalSmoother::default();
        assert!(smoother.displayed().is_none());
        assert_eq!(smoother.step(&[1.0, 2.0]), &[1.0, 2.0]);
    }

    #[test]
    fn converges_monotonically_to_a_constant_target() {
        let mut smoother = TemporalSmoother::default();
        smoother.step(&[0.0, 10.0, 3.0, 0.5]);
        let target = [4.0, 0.0, 3.0, 9.0];

        let mut last = distance(smoother.displayed().unwrap(), &target);
        let mut steps = 0;
        while last > 1e-6 {
            let now = distance(smoother.step(&target), &target);
            assert!(now < last, "distance grew from {last} to {now}");
            last = now;
            steps += 1;
            assert!(steps < 1000, "smoother failed to converge");
        }
    }

    #[test]
    fn one_step_moves_alpha_of_the_way() {
        let mut smoother = TemporalSmoother::new(0.25);
        smoother.step(&[0.0]);
        assert_eq!(smoother.step(&[8.0]), &[2.0]);
    }

    #[test]
    fn shape_change_restarts_from_the_target() {
        let mut smoother = TemporalSmoother::default();
        smoother.step(&[1.0, 1.0]);
        assert_eq!(smoother.step(&[5.0, 5.0, 5.0]), &[5.0, 5.0, 5.0]);
    }

    #[test]
    fn invalid_alpha_falls_back_to_default() {
        assert_eq!(TemporalSmoother::new(0.0).alpha(), DEFAULT_SMOOTHING_ALPHA);
        assert_eq!(TemporalSmoother::new(f64::NAN).alpha(), DEFAULT_SMOOTHING_ALPHA);
        assert_eq!(TemporalSmoother::new(3.0).alpha(), 1.0);
    }
}
