//! Rolling window of recent global stats, for time-series display.

use crate::core_modules::density_frame::GlobalStats;
use std::collections::VecDeque;

/// Default number of samples kept.
pub const DEFAULT_HISTORY_LEN: usize = 60;

#[derive(Debug, Clone)]
pub struct StatsHistory {
    samples: VecDeque<GlobalStats>,
    capacity: usize,
}

impl StatsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, dropping the oldest once full.
    pub fn push(&mut self, stats: GlobalStats) {
        self.samples.push_back(stats);
        if self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&GlobalStats> {
        self.samples.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &GlobalStats> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<GlobalStats> {
        self.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean global density over the window.
    pub fn mean_density(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| s.global_density).sum();
        Some(sum / self.samples.len() as f64)
    }

    /// Largest people count over the window.
    pub fn peak_people(&self) -> Option<f64> {
        self.samples
            .iter()
            .map(|s| s.total_people)
            .fold(None, |peak, v| Some(peak.map_or(v, |p: f64| p.max(v))))
    }
}

impl Default for StatsHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}
