// THEORY:
// The zone boost model is what makes marker placement matter. Around every
// operator-placed marker the grid is given a cone-shaped "attention" bump:
// strongest on the marker's own cell, fading linearly to nothing at the edge
// of a fixed radius. The zone stats sampler reuses the same neighborhood
// geometry.
//
// Key architectural principles:
// 1.  **Derived, Never In Place**: The boosted grid is always a fresh clone. The
//     unboosted frame stays the source of truth for anything that must reflect
//     raw upstream readings.
// 2.  **Additive**: Overlapping markers stack their boosts.
// 3.  **Identity When Idle**: With no markers the output equals the input.

use crate::core_modules::density_frame::GridShape;
use crate::core_modules::zone_marker::ZoneMarker;
use serde::{Deserialize, Serialize};

/// Tunable boost geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostPolicy {
    /// Radius of the neighborhood, in grid cells.
    pub radius_cells: f64,
    /// Fraction of `max_density` added on the marker's own cell.
    pub weight: f64,
}

impl Default for BoostPolicy {
    fn default() -> Self {
        Self {
            radius_cells: 3.0,
            weight: 0.3,
        }
    }
}

/// A cell inside a marker's neighborhood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborCell {
    pub index: usize,
    /// Euclidean distance from the marker's cell, in cells.
    pub distance: f64,
}

/// All cells within `radius` (inclusive) of the cell a marker maps to.
pub fn neighborhood(shape: GridShape, marker: &ZoneMarker, radius: f64) -> Vec<NeighborCell> {
    if shape.is_empty() {
        return Vec::new();
    }
    let (center_col, center_row) = shape.cell_for_percent(marker.x, marker.y);
    if !(radius.is_finite() && radius > 0.0) {
        return vec![NeighborCell {
            index: shape.index(center_col, center_row),
            distance: 0.0,
        }];
    }

    let reach = radius.ceil() as isize;
    let mut cells = Vec::with_capacity(((2 * reach + 1) * (2 * reach + 1)) as usize);
    for dr in -reach..=reach {
        for dc in -reach..=reach {
            let row = center_row as isize + dr;
            let col = center_col as isize + dc;
            if row < 0 || col < 0 || row >= shape.rows as isize || col >= shape.cols as isize {
                continue;
            }
            let distance = ((dr * dr + dc * dc) as f64).sqrt();
            if distance <= radius {
                cells.push(NeighborCell {
                    index: shape.index(col as usize, row as usize),
                    distance,
                });
            }
        }
    }
    cells
}

/// Linear falloff: 1 on the marker's cell, 0 at the radius.
pub fn falloff(distance: f64, radius: f64) -> f64 {
    if radius > 0.0 {
        (1.0 - distance / radius).max(0.0)
    } else {
        1.0
    }
}

/// Returns a clone of `grid` with every marker's boost added.
pub fn boost_grid(
    grid: &[f64],
    shape: GridShape,
    max_density: f64,
    markers: &[ZoneMarker],
    policy: &BoostPolicy,
) -> Vec<f64> {
    let mut boosted = grid.to_vec();
    if markers.is_empty() || policy.weight == 0.0 || grid.len() != shape.len() {
        return boosted;
    }

    let peak = policy.weight * max_density;
    for marker in markers {
        for cell in neighborhood(shape, marker, policy.radius_cells) {
            boosted[cell.index] += falloff(cell.distance, policy.radius_cells) * peak;
        }
    }
    boosted
}
