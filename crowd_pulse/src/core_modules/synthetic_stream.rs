// THEORY:
// `SyntheticStream` stands in for a real analytics producer. It emits the same
// message shape a camera worker would, built from a few gaussian "crowds" that
// drift across the grid and bounce off its edges. An intensity ramp lets a demo
// or a test push the scene from quiet to critical over a known number of frames.
//
// Everything is a pure function of the frame index, so two streams built with
// the same parameters produce identical messages. The stats block is derived
// the way the production producer derives it: people is the grid sum, density
// is that sum against a capacity of 1000, and the risk label mixes the head
// count with the peak cell.

use crate::core_modules::density_frame::GridShape;
use crate::core_modules::normalizer::{UpstreamMessage, UpstreamStats};
use crate::core_modules::risk::RiskLevel;

/// Head count the producer treats as a full venue.
pub const PRODUCER_CAPACITY: f64 = 1000.0;

/// One drifting crowd.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdBlob {
    /// Starting centre, in percent of the frame.
    pub x: f64,
    pub y: f64,
    /// Drift, in percent of the frame per second.
    pub vx: f64,
    pub vy: f64,
    /// Spread, in cells.
    pub sigma_cells: f64,
    /// Cell density at the centre, before the ramp is applied.
    pub peak: f64,
}

/// Linear intensity multiplier from `start` to `end` over `frames`, then held.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub start: f64,
    pub end: f64,
    pub frames: u64,
}

impl Ramp {
    pub fn constant(value: f64) -> Self {
        Self {
            start: value,
            end: value,
            frames: 0,
        }
    }

    pub fn at(&self, frame: u64) -> f64 {
        if self.frames == 0 || frame >= self.frames {
            return self.end;
        }
        let t = frame as f64 / self.frames as f64;
        self.start + (self.end - self.start) * t
    }
}

/// Risk label the production producer attaches to its stats.
pub fn producer_risk(total_people: f64, max_cell: f64) -> RiskLevel {
    if total_people > 500.0 || max_cell > 0.8 {
        RiskLevel::Critical
    } else if total_people > 300.0 || max_cell > 0.5 {
        RiskLevel::High
    } else if total_people > 100.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Deterministic generator of upstream messages.
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    shape: GridShape,
    interval_ms: u64,
    start_ms: u64,
    blobs: Vec<CrowdBlob>,
    ramp: Ramp,
    /// Emit `t_ms` (recorded session) instead of `timestamp`.
    replay: bool,
    frame_index: u64,
}

impl SyntheticStream {
    pub fn new(shape: GridShape, interval_ms: u64) -> Self {
        Self {
            shape,
            interval_ms: interval_ms.max(1),
            start_ms: 0,
            blobs: vec![
                CrowdBlob {
                    x: 30.0,
                    y: 40.0,
                    vx: 4.0,
                    vy: 1.5,
                    sigma_cells: 4.0,
                    peak: 0.4,
                },
                CrowdBlob {
                    x: 70.0,
                    y: 60.0,
                    vx: -3.0,
                    vy: -2.0,
                    sigma_cells: 3.0,
                    peak: 0.3,
                },
            ],
            ramp: Ramp::constant(1.0),
            replay: false,
            frame_index: 0,
        }
    }

    pub fn with_blobs(mut self, blobs: Vec<CrowdBlob>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_ramp(mut self, ramp: Ramp) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn starting_at(mut self, start_ms: u64) -> Self {
        self.start_ms = start_ms;
        self
    }

    /// Tags messages as recorded-session data.
    pub fn as_replay(mut self) -> Self {
        self.replay = true;
        self
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Timestamp of the message `frame` would carry.
    pub fn timestamp_of(&self, frame: u64) -> u64 {
        self.start_ms + frame * self.interval_ms
    }

    /// The grid for a given frame index.
    pub fn grid_at(&self, frame: u64) -> Vec<f64> {
        let seconds = (frame * self.interval_ms) as f64 / 1000.0;
        let intensity = self.ramp.at(frame).max(0.0);
        let (cols, rows) = (self.shape.cols as f64, self.shape.rows as f64);

        let centres: Vec<(f64, f64, &CrowdBlob)> = self
            .blobs
            .iter()
            .map(|blob| {
                let x = bounce(blob.x + blob.vx * seconds);
                let y = bounce(blob.y + blob.vy * seconds);
                (x / 100.0 * cols, y / 100.0 * rows, blob)
            })
            .collect();

        let mut grid = vec![0.0; self.shape.len()];
        for row in 0..self.shape.rows {
            for col in 0..self.shape.cols {
                let (cx, cy) = (col as f64 + 0.5, row as f64 + 0.5);
                grid[self.shape.index(col, row)] = centres
                    .iter()
                    .map(|(bx, by, blob)| {
                        let sigma = blob.sigma_cells.max(0.1);
                        let d2 = (cx - bx).powi(2) + (cy - by).powi(2);
                        blob.peak * intensity * (-d2 / (2.0 * sigma * sigma)).exp()
                    })
                    .sum();
            }
        }
        grid
    }

    /// Builds the message for `frame` without advancing the stream.
    pub fn message_at(&self, frame: u64) -> UpstreamMessage {
        let grid = self.grid_at(frame);
        let total: f64 = grid.iter().sum();
        let max_cell = grid.iter().copied().fold(0.0, f64::max);
        let stamp = self.timestamp_of(frame) as f64;

        UpstreamMessage {
            stats: UpstreamStats {
                total_people: Some(total.floor()),
                global_density: Some((total / PRODUCER_CAPACITY).min(1.0)),
                global_risk_level: Some(producer_risk(total, max_cell).as_str().to_string()),
                max_density: Some(max_cell),
            },
            grid: Some(grid),
            timestamp: (!self.replay).then_some(stamp),
            t_ms: self.replay.then_some(stamp),
            source_type: Some(if self.replay { "recorded" } else { "synthetic" }.to_string()),
        }
    }

    pub fn next_message(&mut self) -> UpstreamMessage {
        let message = self.message_at(self.frame_index);
        self.frame_index += 1;
        message
    }
}

impl Iterator for SyntheticStream {
    type Item = UpstreamMessage;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_message())
    }
}

/// Reflects a coordinate into [0,100].
fn bounce(p: f64) -> f64 {
    let p = p.rem_euclid(200.0);
    if p > 100.0 { 200.0 - p } else { p }
}
