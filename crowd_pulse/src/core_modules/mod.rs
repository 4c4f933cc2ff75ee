pub mod alert_engine;
pub mod colormap;
pub mod density_frame;
pub mod heatmap_renderer;
pub mod heatmap_view;
pub mod normalizer;
pub mod playback_buffer;
pub mod risk;
pub mod smoother;
pub mod snapshot;
pub mod stats_history;
pub mod synthetic_stream;
pub mod zone_boost;
pub mod zone_marker;
pub mod zone_stats;
