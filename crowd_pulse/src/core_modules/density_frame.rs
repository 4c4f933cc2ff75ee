// THEORY:
// The `DensityFrame` is the canonical unit of input for the whole engine. Every
// upstream message, however its producer spelled its fields, ends up as one of
// these: a timestamp, a row-major grid of non-negative densities, and a handful
// of scalar summary statistics.
//
// Key architectural principles:
// 1.  **Immutable Once Built**: Only the `Normalizer` constructs frames. After that
//     they are shared behind an `Arc` by the live path, the playback buffer and the
//     stats history. Per-tick derived data (the boosted grid) is always a clone.
// 2.  **Safe Denominator**: `max_density` is the denominator for every colour and
//     risk computation downstream, so the frame guarantees it is strictly positive.
// 3.  **Shape Travels With The Data**: The grid dimensions are carried next to the
//     grid so cell math never has to guess at the layout.

use crate::core_modules::risk::RiskLevel;
use serde::{Deserialize, Serialize};

/// Default number of grid columns produced by the upstream density model.
pub const DEFAULT_COLS: usize = 60;
/// Default number of grid rows produced by the upstream density model.
pub const DEFAULT_ROWS: usize = 40;

/// Observed maxima below this are considered "no signal".
pub const MAX_DENSITY_EPSILON: f64 = 0.0001;
/// The value substituted for `max_density` when the observed maximum is below epsilon.
pub const MAX_DENSITY_FLOOR: f64 = 0.001;

/// The logical 2-D layout of a flat density grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridShape {
    pub cols: usize,
    pub rows: usize,
}

impl Default for GridShape {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl GridShape {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self { cols, rows }
    }

    /// Total number of cells in the grid.
    pub fn len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major index of a cell.
    pub fn index(&self, col: usize, row: usize) -> usize {
        row * self.cols + col
    }

    /// Maps percentage coordinates (0-100) to the nearest cell, clamping anything
    /// outside the frame onto its edge.
    pub fn cell_for_percent(&self, x: f64, y: f64) -> (usize, usize) {
        (
            Self::axis_cell(x, self.cols),
            Self::axis_cell(y, self.rows),
        )
    }

    fn axis_cell(percent: f64, cells: usize) -> usize {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let cell = ((percent / 100.0) * cells as f64).floor() as usize;
        cell.min(cells.saturating_sub(1))
    }
}

/// Returns a maximum that is safe to divide by.
pub fn floor_max_density(max_density: f64) -> f64 {
    if max_density.is_finite() && max_density >= MAX_DENSITY_EPSILON {
        max_density
    } else {
        MAX_DENSITY_FLOOR
    }
}

/// A single, normalized density reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityFrame {
    /// Monotonic milliseconds since an arbitrary epoch.
    pub timestamp: u64,
    /// Layout of `grid`.
    pub shape: GridShape,
    /// Row-major, non-negative cell densities. Always `shape.len()` long.
    pub grid: Vec<f64>,
    /// Estimated number of people in view.
    pub total_count: f64,
    /// Normalized occupancy ratio in [0,1].
    pub global_density: f64,
    /// Risk label for the whole frame.
    pub global_risk: RiskLevel,
    /// True when `global_risk` came from the producer rather than the default.
    pub risk_reported: bool,
    /// Normalization denominator for display and zone sampling. Never below the floor.
    pub max_density: f64,
}

impl DensityFrame {
    /// The risk used for global alerting: the producer's label when it sent one,
    /// otherwise the same thresholds zones use, applied to `global_density`.
    pub fn global_risk_signal(&self) -> RiskLevel {
        if self.risk_reported {
            self.global_risk
        } else {
            RiskLevel::classify(self.global_density)
        }
    }

    /// Scalar summary for display and the stats history.
    pub fn global_stats(&self) -> GlobalStats {
        GlobalStats {
            timestamp: self.timestamp,
            total_people: self.total_count,
            global_density: self.global_density,
            global_risk: self.global_risk_signal(),
            max_density: self.max_density,
        }
    }
}

/// Frame-level statistics exposed to the display layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub timestamp: u64,
    pub total_people: f64,
    pub global_density: f64,
    pub global_risk: RiskLevel,
    pub max_density: f64,
}
