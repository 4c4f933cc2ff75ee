// THEORY:
// The `pipeline` module is the top-level API for the density engine. It owns
// every stateful component and wires them together, so a host only has to do
// two things: hand it upstream messages as they arrive, and call `tick` at its
// refresh rate.
//
// Data flow:
// 1.  **Ingest** (push-driven): messages are normalized. Replay frames go to the
//     playback buffer and stop there. Live frames become the current frame, are
//     appended to the stats history, and feed the global alert signal.
// 2.  **Tick** (clock-driven): the current frame is boosted around the operator's
//     zone markers, the heatmap view smooths toward the boosted grid and maybe
//     draws it, zone stats are sampled, and zone hysteresis runs.
// 3.  **Seek** (operator-driven): the playback buffer is asked for the frame
//     nearest a position in the recording. A hit is promoted exactly like a live
//     frame; a miss changes nothing.
//
// The pipeline itself is synchronous and single-threaded. `LiveSession` is what
// puts it behind a lock and drives it from tasks.

use crate::config::PipelineConfig;
use crate::core_modules::alert_engine::{AlertEngine, AlertEvent, AlertUpdate};
use crate::core_modules::density_frame::{DensityFrame, GlobalStats};
use crate::core_modules::heatmap_view::HeatmapView;
use crate::core_modules::normalizer::{Ingested, Normalizer, UpstreamMessage};
use crate::core_modules::playback_buffer::PlaybackBuffer;
use crate::core_modules::snapshot::SnapshotCapture;
use crate::core_modules::stats_history::StatsHistory;
use crate::core_modules::zone_boost::boost_grid;
use crate::core_modules::zone_marker::ZoneMarker;
use crate::core_modules::zone_stats::{ZoneSampler, ZoneStats};
use crate::error::PipelineResult;
use image::RgbaImage;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to an ingested message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The frame is now the current live frame.
    Live {
        stats: GlobalStats,
        /// A global alert raised by this frame, if any.
        alert: Option<AlertEvent>,
    },
    /// The frame was stored for playback only.
    Buffered { timestamp: u64 },
}

/// A successful playback lookup, already promoted to the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SeekHit {
    pub frame: Arc<DensityFrame>,
    pub stats: GlobalStats,
    pub alert: Option<AlertEvent>,
}

/// The primary output of a refresh tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub timestamp: u64,
    /// Stats of the current frame; `None` until the first frame arrives.
    pub global: Option<GlobalStats>,
    pub zones: Vec<ZoneStats>,
    /// The rendered overlay, when the heatmap is shown.
    pub heatmap: Option<RgbaImage>,
    /// Zone alerts raised during this tick.
    pub alerts: Vec<AlertEvent>,
}

/// The main, top-level struct for the density engine.
pub struct DensityPipeline {
    config: PipelineConfig,
    normalizer: Normalizer,
    current: Option<Arc<DensityFrame>>,
    view: HeatmapView,
    sampler: ZoneSampler,
    alerts: AlertEngine,
    playback: PlaybackBuffer,
    history: StatsHistory,
    snapshot_capture: Option<Box<dyn SnapshotCapture>>,
}

impl DensityPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            normalizer: Normalizer::new(config.shape, config.max_density_mode),
            current: None,
            view: HeatmapView::new(config.smoothing_alpha, config.render.clone()),
            sampler: ZoneSampler::new(config.boost, config.people_scale),
            alerts: AlertEngine::new(config.alerts.clone()),
            playback: PlaybackBuffer::new(config.playback_window_ms),
            history: StatsHistory::new(config.history_len),
            snapshot_capture: None,
            config,
        }
    }

    /// Attaches the capability used to grab images for zone alerts.
    pub fn with_snapshot_capture(mut self, capture: Box<dyn SnapshotCapture>) -> Self {
        self.snapshot_capture = Some(capture);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Routes one upstream message. A malformed message leaves all state untouched.
    pub fn ingest(&mut self, message: UpstreamMessage, now: u64) -> PipelineResult<IngestOutcome> {
        let ingested = self
            .normalizer
            .normalize(message, now)
            .inspect_err(|e| warn!("Dropping upstream message: {}", e))?;
        Ok(self.route(ingested, now))
    }

    /// Like `ingest`, for a raw JSON message.
    pub fn ingest_json(&mut self, raw: &str, now: u64) -> PipelineResult<IngestOutcome> {
        let ingested = self
            .normalizer
            .normalize_json(raw, now)
            .inspect_err(|e| warn!("Dropping upstream message: {}", e))?;
        Ok(self.route(ingested, now))
    }

    fn route(&mut self, ingested: Ingested, now: u64) -> IngestOutcome {
        match ingested {
            Ingested::Replay(frame) => {
                let timestamp = frame.timestamp;
                debug!(timestamp, "Buffered replay frame");
                self.playback.record(frame);
                IngestOutcome::Buffered { timestamp }
            }
            Ingested::Live(frame) => {
                debug!(timestamp = frame.timestamp, "Live frame");
                let (stats, alert) = self.promote(Arc::new(frame), now);
                IngestOutcome::Live { stats, alert }
            }
        }
    }

    /// Makes `frame` the current frame and runs the frame-level bookkeeping.
    fn promote(
        &mut self,
        frame: Arc<DensityFrame>,
        now: u64,
    ) -> (GlobalStats, Option<AlertEvent>) {
        let stats = frame.global_stats();
        self.history.push(stats.clone());
        let alert = self
            .alerts
            .observe_global(now, frame.global_risk_signal(), &stats);
        self.current = Some(frame);
        (stats, alert)
    }

    /// One refresh of the render loop.
    pub fn tick(&mut self, markers: &[ZoneMarker], now: u64) -> TickReport {
        let Some(frame) = self.current.clone() else {
            return TickReport {
                timestamp: now,
                ..TickReport::default()
            };
        };

        // --- 1. Attention Boost ---
        let boosted = boost_grid(
            &frame.grid,
            frame.shape,
            frame.max_density,
            markers,
            &self.config.boost,
        );

        // --- 2. Smoothing & Rendering ---
        let heatmap = self.view.advance(&boosted, frame.shape, frame.max_density);

        // --- 3. Zone Statistics ---
        let zones = self
            .sampler
            .sample_all(&boosted, frame.shape, frame.max_density, markers);

        // --- 4. Zone Alerting ---
        let alerts =
            self.alerts
                .observe_zones(now, &zones, markers, self.snapshot_capture.as_deref());

        TickReport {
            timestamp: now,
            global: Some(frame.global_stats()),
            zones,
            heatmap,
            alerts,
        }
    }

    /// Shows the recorded frame nearest `query_ms`. A miss keeps the current state.
    pub fn seek(&mut self, query_ms: u64, now: u64) -> Option<SeekHit> {
        let Some(frame) = self.playback.lookup(query_ms) else {
            debug!(query_ms, "No recorded frame close enough");
            return None;
        };
        let (stats, alert) = self.promote(Arc::clone(&frame), now);
        Some(SeekHit {
            frame,
            stats,
            alert,
        })
    }

    pub fn resolve_alert(&mut self, id: &str) -> PipelineResult<AlertUpdate> {
        self.alerts.resolve(id)
    }

    pub fn set_heatmap_visible(&mut self, visible: bool) {
        self.view.set_visible(visible);
    }

    pub fn set_heatmap_enabled(&mut self, enabled: bool) {
        self.view.set_enabled(enabled);
    }

    pub fn set_opacity(&mut self, opacity: f64) {
        self.view.set_opacity(opacity);
    }

    pub fn heatmap_view(&self) -> &HeatmapView {
        &self.view
    }

    /// Forgets everything tied to the current session. Display toggles survive.
    pub fn reset_session(&mut self) {
        self.normalizer.reset();
        self.current = None;
        self.view.reset();
        self.alerts.reset();
        self.playback.clear();
        self.history.clear();
    }

    pub fn current_frame(&self) -> Option<&Arc<DensityFrame>> {
        self.current.as_ref()
    }

    pub fn current_stats(&self) -> Option<GlobalStats> {
        self.current.as_ref().map(|frame| frame.global_stats())
    }

    pub fn history(&self) -> &StatsHistory {
        &self.history
    }

    /// Retained alerts, newest first.
    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.alerts().cloned().collect()
    }

    pub fn alert_engine(&self) -> &AlertEngine {
        &self.alerts
    }

    pub fn playback(&self) -> &PlaybackBuffer {
        &self.playback
    }
}

impl Default for DensityPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::alert_engine::AlertKind;
    use crate::core_modules::density_frame::GridShape;
    use crate::core_modules::heatmap_renderer::RenderSettings;
    use crate::core_modules::normalizer::{MaxDensityMode, UpstreamStats};
    use crate::core_modules::risk::RiskLevel;
    use crate::error::PipelineError;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            shape: GridShape::new(10, 10),
            render: RenderSettings {
                width: 20,
                height: 20,
                blur_sigma: 0.0,
                ..RenderSettings::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn message(fill: f64, risk: &str) -> UpstreamMessage {
        UpstreamMessage {
            grid: Some(vec![fill; 100]),
            stats: UpstreamStats {
                total_people: Some(fill * 100.0),
                global_density: Some(fill),
                global_risk_level: Some(risk.to_string()),
                max_density: Some(1.0),
            },
            ..UpstreamMessage::default()
        }
    }

    fn replay(fill: f64, t_ms: f64) -> UpstreamMessage {
        UpstreamMessage {
            t_ms: Some(t_ms),
            ..message(fill, "low")
        }
    }

    #[test]
    fn live_frames_become_current() {
        let mut pipeline = DensityPipeline::new(small_config());
        let outcome = pipeline.ingest(message(0.2, "low"), 10).unwrap();
        assert!(matches!(outcome, IngestOutcome::Live { alert: None, .. }));
        assert_eq!(pipeline.current_stats().unwrap().total_people, 20.0);
        assert_eq!(pipeline.history().len(), 1);
    }

    #[test]
    fn malformed_frames_leave_state_untouched() {
        let mut pipeline = DensityPipeline::new(small_config());
        pipeline.ingest(message(0.2, "low"), 10).unwrap();

        let bad = UpstreamMessage {
            grid: Some(vec![0.0; 7]),
            ..message(0.9, "critical")
        };
        assert!(matches!(
            pipeline.ingest(bad, 20),
            Err(PipelineError::MalformedFrame { .. })
        ));
        assert!(matches!(
            pipeline.ingest_json("{ not json", 30),
            Err(PipelineError::MalformedFrame { .. })
        ));
        assert_eq!(pipeline.current_stats().unwrap().total_people, 20.0);
        assert_eq!(pipeline.history().len(), 1);
        assert!(pipeline.alerts().is_empty());
    }

    #[test]
    fn replay_frames_never_touch_the_live_state() {
        let mut pipeline = DensityPipeline::new(small_config());
        pipeline.ingest(message(0.2, "low"), 10).unwrap();
        let outcome = pipeline.ingest(replay(0.9, 1_000.0), 20).unwrap();

        assert_eq!(outcome, IngestOutcome::Buffered { timestamp: 1_000 });
        assert_eq!(pipeline.current_stats().unwrap().total_people, 20.0);
        assert_eq!(pipeline.playback().len(), 1);
    }

    #[test]
    fn seek_hits_promote_and_misses_do_nothing() {
        let mut pipeline = DensityPipeline::new(small_config());
        pipeline.ingest(replay(0.3, 1_000.0), 0).unwrap();
        pipeline.ingest(replay(0.6, 2_000.0), 0).unwrap();

        let hit = pipeline.seek(1_400, 50).unwrap();
        assert_eq!(hit.frame.timestamp, 1_000);
        assert_eq!(pipeline.current_frame().unwrap().timestamp, 1_000);

        assert!(pipeline.seek(3_000, 60).is_none());
        assert_eq!(pipeline.current_frame().unwrap().timestamp, 1_000);
        assert_eq!(pipeline.history().len(), 1);
    }

    #[test]
    fn same_frame_twice_renders_identically() {
        let gradient = UpstreamMessage {
            grid: Some((0..100).map(|i| i as f64 * 0.02).collect()),
            stats: UpstreamStats::default(),
            ..UpstreamMessage::default()
        };
        for mode in [MaxDensityMode::Frame, MaxDensityMode::Running] {
            let mut pipeline = DensityPipeline::new(PipelineConfig {
                max_density_mode: mode,
                ..small_config()
            });

            pipeline.ingest(gradient.clone(), 0).unwrap();
            let first_max = pipeline.current_frame().unwrap().max_density;
            let first = pipeline.tick(&[], 0).heatmap.unwrap();

            pipeline.ingest(gradient.clone(), 100).unwrap();
            let second_max = pipeline.current_frame().unwrap().max_density;
            let second = pipeline.tick(&[], 100).heatmap.unwrap();

            assert_eq!(first_max, second_max, "{mode:?}");
            assert_eq!(first, second, "{mode:?}");
        }
    }

    #[test]
    fn tick_before_any_frame_is_empty() {
        let mut pipeline = DensityPipeline::new(small_config());
        let report = pipeline.tick(&[ZoneMarker::new(1, "Gate", 50.0, 50.0)], 0);
        assert!(report.global.is_none());
        assert!(report.zones.is_empty());
        assert!(report.heatmap.is_none());
    }

    #[test]
    fn tick_renders_and_samples_zones() {
        let mut pipeline = DensityPipeline::new(small_config());
        pipeline.ingest(message(0.9, "critical"), 0).unwrap();
        let markers = [ZoneMarker::new(1, "Gate", 50.0, 50.0)];

        let report = pipeline.tick(&markers, 0);
        let heatmap = report.heatmap.unwrap();
        assert_eq!(heatmap.dimensions(), (20, 20));
        assert_eq!(report.zones.len(), 1);
        assert_eq!(report.zones[0].risk_level, RiskLevel::Critical);

        pipeline.set_heatmap_visible(false);
        assert!(pipeline.tick(&markers, 100).heatmap.is_none());
    }

    #[test]
    fn sustained_zone_risk_alerts_through_tick() {
        let mut pipeline = DensityPipeline::new(small_config());
        pipeline.ingest(message(0.9, "low"), 0).unwrap();
        let markers = [ZoneMarker::new(1, "Gate", 50.0, 50.0)];

        let mut raised = Vec::new();
        for now in (0..=4_000).step_by(100) {
            raised.extend(pipeline.tick(&markers, now).alerts);
        }
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::SustainedRisk);
        assert_eq!(raised[0].timestamp, 3_000);

        let resolved = pipeline.resolve_alert(&raised[0].id).unwrap();
        assert_eq!(
            resolved,
            AlertUpdate::Resolved {
                id: raised[0].id.clone()
            }
        );
        assert!(pipeline.resolve_alert(&raised[0].id).is_err());
    }

    #[test]
    fn reset_session_clears_everything_but_toggles() {
        let mut pipeline = DensityPipeline::new(small_config());
        pipeline.set_heatmap_visible(false);
        pipeline.ingest(message(0.9, "critical"), 0).unwrap();
        pipeline.ingest(replay(0.3, 1_000.0), 0).unwrap();
        pipeline.tick(&[], 0);

        pipeline.reset_session();
        assert!(pipeline.current_frame().is_none());
        assert!(pipeline.history().is_empty());
        assert!(pipeline.playback().is_empty());
        assert!(pipeline.alerts().is_empty());
        assert!(pipeline.heatmap_view().displayed().is_none());
        assert!(!pipeline.heatmap_view().is_visible());
    }
}
