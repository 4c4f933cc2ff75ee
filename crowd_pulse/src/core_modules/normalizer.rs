// THEORY:
// The `Normalizer` is the boundary between the outside world and the engine.
// Upstream producers (live camera workers, drone feeds, offline video jobs) all
// emit "a grid plus some stats", but they do not agree on field names, and some
// of them omit fields entirely. This module absorbs that mess once, so that
// nothing downstream ever sees anything but a well-formed `DensityFrame`.
//
// Key architectural principles:
// 1.  **First Present Wins**: Each statistic has a list of accepted spellings. The
//     first spelling present in the message is used; a field that is present but
//     not a number makes the whole message malformed.
// 2.  **Routing, Not Just Parsing**: A message that carries an explicit historical
//     timestamp (`t_ms`) is replay data for a recorded session. It comes back as
//     `Ingested::Replay` and must never be treated as the current live frame.
// 3.  **Pure Transform**: Apart from the optional running maximum, normalization has
//     no side effects. A rejected message leaves every piece of live state as it was.

use crate::core_modules::density_frame::{DensityFrame, GridShape, floor_max_density};
use crate::core_modules::risk::RiskLevel;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

const PEOPLE_KEYS: &[&str] = &["totalPeople", "total_people", "totalCount", "total_count"];
const DENSITY_KEYS: &[&str] = &["globalDensity", "global_density", "density"];
const RISK_KEYS: &[&str] = &["globalRiskLevel", "globalRisk", "risk_level", "riskLevel"];
const MAX_KEYS: &[&str] = &["maxDensity", "max_density"];

/// Summary statistics as sent by a producer, after alias resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Map<String, Value>")]
pub struct UpstreamStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_people: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_density: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_density: Option<f64>,
}

impl TryFrom<Map<String, Value>> for UpstreamStats {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        Ok(Self {
            total_people: first_number(&map, PEOPLE_KEYS)?,
            global_density: first_number(&map, DENSITY_KEYS)?,
            global_risk_level: RISK_KEYS
                .iter()
                .find_map(|key| map.get(*key))
                .and_then(|v| v.as_str().map(str::to_owned)),
            max_density: first_number(&map, MAX_KEYS)?,
        })
    }
}

fn first_number(map: &Map<String, Value>, keys: &[&str]) -> Result<Option<f64>, String> {
    let Some((key, value)) = keys.iter().find_map(|k| map.get(*k).map(|v| (*k, v))) else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("stat '{key}' is not representable as f64")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("stat '{key}' is not numeric: '{s}'")),
        other => Err(format!("stat '{key}' has unexpected type: {other}")),
    }
}

/// One message from the upstream analytics producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamMessage {
    #[serde(default)]
    pub grid: Option<Vec<f64>>,
    #[serde(default)]
    pub stats: UpstreamStats,
    /// Wall-clock emission time of a live message, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Position in a recorded session, in milliseconds. Marks the message as replay data.
    #[serde(default, rename = "t_ms", skip_serializing_if = "Option::is_none")]
    pub t_ms: Option<f64>,
    #[serde(default, alias = "source_type", skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
}

impl UpstreamMessage {
    pub fn is_replay(&self) -> bool {
        self.t_ms.is_some()
    }
}

/// Where a normalized frame must go.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// The newest live reading; becomes the current frame.
    Live(DensityFrame),
    /// A recorded-session reading; belongs in the playback buffer only.
    Replay(DensityFrame),
}

/// How `max_density` is chosen for live frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxDensityMode {
    /// Each frame is scaled by its own maximum.
    #[default]
    Frame,
    /// Live frames are scaled by the largest maximum seen this session.
    Running,
}

/// Converts upstream messages into canonical frames.
#[derive(Debug, Clone)]
pub struct Normalizer {
    shape: GridShape,
    mode: MaxDensityMode,
    /// The largest live maximum seen so far. Only used in `Running` mode.
    running_max: f64,
}

impl Normalizer {
    pub fn new(shape: GridShape, mode: MaxDensityMode) -> Self {
        Self {
            shape,
            mode,
            running_max: 0.0,
        }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Forgets the running maximum. Called when a new session starts.
    pub fn reset(&mut self) {
        self.running_max = 0.0;
    }

    /// Decodes a JSON message and normalizes it. Decode failures are malformed frames.
    pub fn normalize_json(&mut self, raw: &str, received_at: u64) -> PipelineResult<Ingested> {
        let message: UpstreamMessage = serde_json::from_str(raw)
            .map_err(|e| PipelineError::malformed(format!("undecodable message: {e}")))?;
        self.normalize(message, received_at)
    }

    /// Normalizes one message. `received_at` stands in for a missing live timestamp.
    pub fn normalize(
        &mut self,
        message: UpstreamMessage,
        received_at: u64,
    ) -> PipelineResult<Ingested> {
        let UpstreamMessage {
            grid,
            stats,
            timestamp,
            t_ms,
            ..
        } = message;

        // --- 1. Grid Validation ---
        let mut grid = grid.ok_or_else(|| PipelineError::malformed("missing grid"))?;
        if grid.len() != self.shape.len() {
            return Err(PipelineError::malformed(format!(
                "grid has {} cells, expected {} ({}x{})",
                grid.len(),
                self.shape.len(),
                self.shape.cols,
                self.shape.rows
            )));
        }
        if let Some(i) = grid.iter().position(|v| !v.is_finite()) {
            return Err(PipelineError::malformed(format!(
                "grid cell {i} is not finite"
            )));
        }
        for cell in grid.iter_mut() {
            if *cell < 0.0 {
                *cell = 0.0;
            }
        }

        // --- 2. Stats With Defaults ---
        let total_count = finite_stat("totalPeople", stats.total_people)?
            .unwrap_or(0.0)
            .max(0.0);
        let global_density = finite_stat("globalDensity", stats.global_density)?
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let reported_risk = stats.global_risk_level.as_deref().and_then(|label| {
            label
                .parse::<RiskLevel>()
                .map_err(|e| debug!("Ignoring risk label: {}", e))
                .ok()
        });

        // --- 3. Maximum ---
        let frame_max = match finite_stat("maxDensity", stats.max_density)? {
            Some(max) if max > 0.0 => max,
            _ => grid.iter().copied().fold(0.0, f64::max),
        };

        // --- 4. Routing ---
        if let Some(t_ms) = t_ms {
            if !t_ms.is_finite() || t_ms < 0.0 {
                return Err(PipelineError::malformed(format!(
                    "replay timestamp {t_ms} is invalid"
                )));
            }
            let frame = self.build(
                t_ms.round() as u64,
                grid,
                total_count,
                global_density,
                reported_risk,
                floor_max_density(frame_max),
            );
            return Ok(Ingested::Replay(frame));
        }

        let max_density = match self.mode {
            MaxDensityMode::Frame => frame_max,
            MaxDensityMode::Running => {
                self.running_max = self.running_max.max(frame_max);
                self.running_max
            }
        };
        let timestamp = timestamp
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(|t| t.round() as u64)
            .unwrap_or(received_at);

        Ok(Ingested::Live(self.build(
            timestamp,
            grid,
            total_count,
            global_density,
            reported_risk,
            floor_max_density(max_density),
        )))
    }

    fn build(
        &self,
        timestamp: u64,
        grid: Vec<f64>,
        total_count: f64,
        global_density: f64,
        reported_risk: Option<RiskLevel>,
        max_density: f64,
    ) -> DensityFrame {
        DensityFrame {
            timestamp,
            shape: self.shape,
            grid,
            total_count,
            global_density,
            global_risk: reported_risk.unwrap_or_default(),
            risk_reported: reported_risk.is_some(),
            max_density,
        }
    }
}

fn finite_stat(name: &str, value: Option<f64>) -> PipelineResult<Option<f64>> {
    match value {
        Some(v) if !v.is_finite() => Err(PipelineError::malformed(format!(
            "stat '{name}' is not finite"
        ))),
        other => Ok(other),
    }
}
