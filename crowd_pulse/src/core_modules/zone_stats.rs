// THEORY:
// Zone stats turn a marker into numbers an operator can act on. Every tick, each
// marker's neighborhood on the boosted grid is sampled with the same cone
// weighting the boost uses, normalized by the frame's maximum, and classified
// with the shared risk thresholds. The results are ephemeral: they are rebuilt
// from scratch every tick and never patched incrementally.

use crate::core_modules::density_frame::GridShape;
use crate::core_modules::risk::RiskLevel;
use crate::core_modules::zone_boost::{BoostPolicy, falloff, neighborhood};
use crate::core_modules::zone_marker::ZoneMarker;
use serde::{Deserialize, Serialize};

/// Default number of people a zone holds at full normalized density.
pub const DEFAULT_PEOPLE_SCALE: f64 = 50.0;

/// Per-zone statistics for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStats {
    pub id: u64,
    pub name: String,
    /// A rough, deterministic estimate. Not a count.
    pub people_count_estimate: u32,
    /// Normalized density in [0,1].
    pub density: f64,
    pub risk_level: RiskLevel,
}

/// Samples zone statistics from a (boosted) grid.
#[derive(Debug, Clone, Copy)]
pub struct ZoneSampler {
    pub policy: BoostPolicy,
    pub people_scale: f64,
}

impl ZoneSampler {
    pub fn new(policy: BoostPolicy, people_scale: f64) -> Self {
        Self {
            policy,
            people_scale,
        }
    }

    /// Raw neighborhood-weighted density around a marker, before normalization.
    pub fn raw_sample(&self, grid: &[f64], shape: GridShape, marker: &ZoneMarker) -> f64 {
        let radius = self.policy.radius_cells;
        let (weighted, total_weight) = neighborhood(shape, marker, radius)
            .into_iter()
            .filter_map(|cell| {
                let weight = falloff(cell.distance, radius);
                let value = grid.get(cell.index)?;
                (weight > 0.0).then_some((value * weight, weight))
            })
            .fold((0.0, 0.0), |(sum, total), (v, w)| (sum + v, total + w));

        if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        }
    }

    /// Stats for a single marker.
    pub fn sample(
        &self,
        grid: &[f64],
        shape: GridShape,
        max_density: f64,
        marker: &ZoneMarker,
    ) -> ZoneStats {
        let raw = self.raw_sample(grid, shape, marker);
        let density = if max_density > 0.0 {
            (raw / max_density).clamp(0.0, 1.0)
        } else {
            0.0
        };
        ZoneStats {
            id: marker.id,
            name: marker.name.clone(),
            people_count_estimate: (density * self.people_scale).round().max(0.0) as u32,
            density,
            risk_level: RiskLevel::classify(density),
        }
    }

    /// Stats for every marker, in marker order.
    pub fn sample_all(
        &self,
        grid: &[f64],
        shape: GridShape,
        max_density: f64,
        markers: &[ZoneMarker],
    ) -> Vec<ZoneStats> {
        markers
            .iter()
            .map(|marker| self.sample(grid, shape, max_density, marker))
            .collect()
    }
}

impl Default for ZoneSampler {
    fn default() -> Self {
        Self::new(BoostPolicy::default(), DEFAULT_PEOPLE_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_grid_samples_its_own_value() {
        let shape = GridShape::new(20, 20);
        let grid = vec![0.7; shape.len()];
        let sampler = ZoneSampler::default();
        let stats = sampler.sample(&grid, shape, 1.0, &ZoneMarker::new(3, "Gate", 50.0, 50.0));

        assert_eq!(stats.id, 3);
        assert_eq!(stats.name, "Gate");
        assert!((stats.density - 0.7).abs() < 1e-9);
        assert_eq!(stats.risk_level, RiskLevel::High);
        assert_eq!(stats.people_count_estimate, 35);
    }

    #[test]
    fn marker_cell_dominates_the_sample() {
        let shape = GridShape::new(20, 20);
        let mut grid = vec![0.0; shape.len()];
        let marker = ZoneMarker::new(1, "Hot", 50.0, 50.0);
        let (col, row) = shape.cell_for_percent(marker.x, marker.y);
        grid[shape.index(col, row)] = 1.0;

        let sampler = ZoneSampler::default();
        let centered = sampler.raw_sample(&grid, shape, &marker);
        let elsewhere = sampler.raw_sample(&grid, shape, &ZoneMarker::new(2, "Cold", 5.0, 5.0));
        assert!(centered > 0.0);
        assert_eq!(elsewhere, 0.0);
    }

    #[test]
    fn density_is_clamped_to_unit_range() {
        let shape = GridShape::new(10, 10);
        let grid = vec![5.0; shape.len()];
        let stats = ZoneSampler::default().sample(&grid, shape, 1.0, &ZoneMarker::new(1, "z", 0.0, 0.0));
        assert_eq!(stats.density, 1.0);
        assert_eq!(stats.risk_level, RiskLevel::Critical);
        assert_eq!(stats.people_count_estimate, 50);
    }

    #[test]
    fn no_markers_no_stats() {
        let shape = GridShape::new(10, 10);
        let grid = vec![0.0; shape.len()];
        assert!(ZoneSampler::default().sample_all(&grid, shape, 1.0, &[]).is_empty());
    }
}
