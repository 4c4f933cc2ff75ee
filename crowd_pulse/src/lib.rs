// THEORY:
// This file is the main entry point for the `crowd_pulse` library crate.
// It defines the public API exposed to hosts such as the visualizer server and
// the session replayer.
//
// The primary interface is `DensityPipeline` (synchronous, driven by the caller's
// clock) and `LiveSession` (the same pipeline driven by tokio tasks). The
// algorithmic pieces live in `core_modules` and are public so they can be
// reused and tested on their own, but a host normally only needs what is
// re-exported here.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod live_session;
pub mod pipeline;

pub use config::PipelineConfig;
pub use core_modules::alert_engine::{AlertEvent, AlertKind, AlertPolicy, AlertUpdate};
pub use core_modules::density_frame::{DensityFrame, GlobalStats, GridShape};
pub use core_modules::heatmap_renderer::RenderSettings;
pub use core_modules::normalizer::{MaxDensityMode, UpstreamMessage, UpstreamStats};
pub use core_modules::risk::RiskLevel;
pub use core_modules::snapshot::{Snapshot, SnapshotCapture};
pub use core_modules::synthetic_stream::{Ramp, SyntheticStream};
pub use core_modules::zone_boost::BoostPolicy;
pub use core_modules::zone_marker::{ZoneMarker, ZoneMarkerSet};
pub use core_modules::zone_stats::ZoneStats;
pub use error::{PipelineError, PipelineResult};
pub use live_session::{LiveSession, LiveSessionConfig, SessionUpdate};
pub use pipeline::{DensityPipeline, IngestOutcome, SeekHit, TickReport};
