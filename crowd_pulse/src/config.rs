//! Pipeline configuration.
//!
//! Every field has a default. A config can be read from JSON (missing fields keep
//! their defaults) and then adjusted through `CROWD_PULSE_*` environment variables.

use crate::core_modules::alert_engine::AlertPolicy;
use crate::core_modules::density_frame::GridShape;
use crate::core_modules::heatmap_renderer::RenderSettings;
use crate::core_modules::normalizer::MaxDensityMode;
use crate::core_modules::playback_buffer::DEFAULT_MATCH_WINDOW_MS;
use crate::core_modules::smoother::DEFAULT_SMOOTHING_ALPHA;
use crate::core_modules::stats_history::DEFAULT_HISTORY_LEN;
use crate::core_modules::zone_boost::BoostPolicy;
use crate::core_modules::zone_stats::DEFAULT_PEOPLE_SCALE;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Configuration for the `DensityPipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Expected grid layout of every upstream message.
    pub shape: GridShape,
    /// Fraction of the remaining distance covered per refresh.
    pub smoothing_alpha: f64,
    pub render: RenderSettings,
    pub boost: BoostPolicy,
    /// People a zone holds at full normalized density.
    pub people_scale: f64,
    pub alerts: AlertPolicy,
    /// Maximum distance between a seek query and the frame it returns.
    pub playback_window_ms: u64,
    /// Number of global stats samples kept for charts.
    pub history_len: usize,
    pub max_density_mode: MaxDensityMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shape: GridShape::default(),
            smoothing_alpha: DEFAULT_SMOOTHING_ALPHA,
            render: RenderSettings::default(),
            boost: BoostPolicy::default(),
            people_scale: DEFAULT_PEOPLE_SCALE,
            alerts: AlertPolicy::default(),
            playback_window_ms: DEFAULT_MATCH_WINDOW_MS,
            history_len: DEFAULT_HISTORY_LEN,
            max_density_mode: MaxDensityMode::default(),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `CROWD_PULSE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key lookup. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(&format!("CROWD_PULSE_{key}"));

        if let Some(cols) = parse_as::<usize>(&get, "GRID_COLS") {
            self.shape.cols = cols;
        }
        if let Some(rows) = parse_as::<usize>(&get, "GRID_ROWS") {
            self.shape.rows = rows;
        }
        if let Some(alpha) = parse_as(&get, "SMOOTHING_ALPHA") {
            self.smoothing_alpha = alpha;
        }
        if let Some(radius) = parse_as(&get, "BOOST_RADIUS") {
            self.boost.radius_cells = radius;
        }
        if let Some(weight) = parse_as(&get, "BOOST_WEIGHT") {
            self.boost.weight = weight;
        }
        if let Some(scale) = parse_as(&get, "PEOPLE_SCALE") {
            self.people_scale = scale;
        }
        if let Some(ms) = parse_as(&get, "SUSTAIN_MS") {
            self.alerts.sustain_ms = ms;
        }
        if let Some(ms) = parse_as(&get, "CHECKUP_MS") {
            self.alerts.checkup_interval_ms = ms;
        }
        if let Some(ms) = parse_as(&get, "PLAYBACK_WINDOW_MS") {
            self.playback_window_ms = ms;
        }
        if let Some(len) = parse_as(&get, "HISTORY_LEN") {
            self.history_len = len;
        }
        match get("MAX_DENSITY_MODE").as_deref().map(str::trim) {
            Some("running") => self.max_density_mode = MaxDensityMode::Running,
            Some("frame") => self.max_density_mode = MaxDensityMode::Frame,
            _ => {}
        }
        self
    }
}

fn parse_as<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_json_fields_keep_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "smoothing_alpha": 0.25, "alerts": { "sustain_ms": 1000 } }"#)
                .unwrap();
        assert_eq!(config.smoothing_alpha, 0.25);
        assert_eq!(config.alerts.sustain_ms, 1_000);
        assert_eq!(config.alerts.checkup_interval_ms, 60_000);
        assert_eq!(config.shape, GridShape::new(60, 40));
        assert_eq!(config.playback_window_ms, 500);
    }

    #[test]
    fn partial_nested_sections_keep_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "boost": { "weight": 0.5 } }"#).unwrap();
        assert_eq!(config.boost.weight, 0.5);
        assert_eq!(config.boost.radius_cells, BoostPolicy::default().radius_cells);

        let config: PipelineConfig =
            serde_json::from_str(r#"{ "shape": { "cols": 30 } }"#).unwrap();
        assert_eq!(config.shape, GridShape::new(30, 40));
    }

    #[test]
    fn overrides_apply_on_top() {
        let vars: HashMap<&str, &str> = [
            ("CROWD_PULSE_GRID_COLS", "30"),
            ("CROWD_PULSE_SMOOTHING_ALPHA", " 0.5 "),
            ("CROWD_PULSE_SUSTAIN_MS", "2000"),
            ("CROWD_PULSE_MAX_DENSITY_MODE", "running"),
            ("CROWD_PULSE_HISTORY_LEN", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.shape, GridShape::new(30, 40));
        assert_eq!(config.smoothing_alpha, 0.5);
        assert_eq!(config.alerts.sustain_ms, 2_000);
        assert_eq!(config.max_density_mode, MaxDensityMode::Running);
        assert_eq!(config.history_len, DEFAULT_HISTORY_LEN);
    }
}
