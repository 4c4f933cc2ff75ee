use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use crowd_pulse::{
    AlertUpdate, GlobalStats, LiveSession, PipelineError, SessionUpdate, ZoneMarker,
    ZoneMarkerSet, ZoneStats,
};
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum VisualizerError {
    #[error("Failed to encode heatmap frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Png,
}

impl FrameFormat {
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
        }
    }
}

/// One encoded heatmap overlay.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub ts_millis: u64,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub data: Arc<[u8]>,
}

impl FramePacket {
    pub fn encode(ts_millis: u64, image: &RgbaImage) -> Result<Self, VisualizerError> {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(Self {
            ts_millis,
            width: image.width(),
            height: image.height(),
            format: FrameFormat::Png,
            data: buf.into(),
        })
    }
}

/// Text-channel messages for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Meta {
    Tick {
        timestamp: u64,
        global: Option<GlobalStats>,
        zones: Vec<ZoneStats>,
    },
    Stats {
        stats: GlobalStats,
    },
    Alert {
        update: AlertUpdate,
    },
    Markers {
        markers: Vec<ZoneMarker>,
    },
}

#[derive(Clone)]
pub struct FrameBus {
    pub frames_tx: broadcast::Sender<FramePacket>,
    pub meta_tx: broadcast::Sender<Meta>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (meta_tx, _) = broadcast::channel::<Meta>(capacity.max(1));
        Self { frames_tx, meta_tx }
    }
}

/// Turns one session update into bus traffic. Frames are only encoded while
/// someone is listening for them.
pub fn publish_update(bus: &FrameBus, update: SessionUpdate) -> Result<(), VisualizerError> {
    match update {
        SessionUpdate::Tick(report) => {
            if let Some(heatmap) = &report.heatmap {
                if bus.frames_tx.receiver_count() > 0 {
                    let packet = FramePacket::encode(report.timestamp, heatmap)?;
                    let _ = bus.frames_tx.send(packet);
                }
            }
            let _ = bus.meta_tx.send(Meta::Tick {
                timestamp: report.timestamp,
                global: report.global.clone(),
                zones: report.zones.clone(),
            });
        }
        SessionUpdate::Stats(stats) => {
            let _ = bus.meta_tx.send(Meta::Stats { stats });
        }
        SessionUpdate::Alert(update) => {
            let _ = bus.meta_tx.send(Meta::Alert { update });
        }
    }
    Ok(())
}

/// Forwards everything a session publishes onto the bus until the session ends.
pub fn forward_updates(bus: FrameBus, session: &LiveSession) -> JoinHandle<()> {
    let mut updates = session.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if let Err(e) = publish_update(&bus, update) {
                        warn!("Dropping visualizer update: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Visualizer fell behind the session");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Render loop period of the session behind the server.
    pub refresh_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            refresh_interval: Duration::from_millis(33),
        }
    }
}

impl ServerConfig {
    /// Create config from `CP_BIND` and `CP_REFRESH_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("CP_BIND")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.bind_addr),
            refresh_interval: std::env::var("CP_REFRESH_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.refresh_interval),
        }
    }
}

/// Operator controls over a running session, shared by all HTTP handlers.
#[derive(Clone)]
pub struct ControlHandle {
    session: Arc<LiveSession>,
    markers: Arc<Mutex<ZoneMarkerSet>>,
    bus: FrameBus,
}

impl ControlHandle {
    pub fn new(session: Arc<LiveSession>, bus: FrameBus) -> Self {
        Self {
            session,
            markers: Arc::new(Mutex::new(ZoneMarkerSet::new())),
            bus,
        }
    }

    pub fn session(&self) -> &Arc<LiveSession> {
        &self.session
    }

    pub async fn set_heatmap_visible(&self, visible: bool) -> Result<(), VisualizerError> {
        Ok(self.session.set_heatmap_visible(visible).await?)
    }

    pub async fn set_heatmap_enabled(&self, enabled: bool) -> Result<(), VisualizerError> {
        Ok(self.session.set_heatmap_enabled(enabled).await?)
    }

    pub async fn set_opacity(&self, opacity: f64) -> Result<(), VisualizerError> {
        Ok(self.session.set_opacity(opacity).await?)
    }

    pub async fn seek(&self, query_ms: u64) -> Result<Option<GlobalStats>, VisualizerError> {
        Ok(self.session.seek(query_ms).await?)
    }

    pub async fn resolve_alert(&self, id: &str) -> Result<AlertUpdate, VisualizerError> {
        Ok(self.session.resolve_alert(id).await?)
    }

    /// Recent global stats, oldest first.
    pub async fn history(&self) -> Vec<GlobalStats> {
        self.session.pipeline().lock().await.history().to_vec()
    }

    pub async fn markers(&self) -> Vec<ZoneMarker> {
        self.markers.lock().await.to_vec()
    }

    pub async fn add_marker(&self, name: Option<&str>, x: f64, y: f64) -> ZoneMarker {
        let mut markers = self.markers.lock().await;
        let marker = markers.add(name, x, y).clone();
        self.sync_markers(&markers);
        marker
    }

    pub async fn remove_marker(&self, id: u64) -> Option<ZoneMarker> {
        let mut markers = self.markers.lock().await;
        let removed = markers.remove(id)?;
        self.sync_markers(&markers);
        Some(removed)
    }

    pub async fn rename_marker(&self, id: u64, name: &str) -> Option<ZoneMarker> {
        let mut markers = self.markers.lock().await;
        if !markers.rename(id, name) {
            return None;
        }
        self.sync_markers(&markers);
        markers.get(id).cloned()
    }

    fn sync_markers(&self, markers: &ZoneMarkerSet) {
        let snapshot = markers.to_vec();
        self.session.set_markers(snapshot.clone());
        let _ = self.bus.meta_tx.send(Meta::Markers { markers: snapshot });
    }
}

#[cfg(feature = "web")]
pub async fn start_server(
    bus: FrameBus,
    cfg: ServerConfig,
    control: ControlHandle,
) -> anyhow::Result<JoinHandle<()>> {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use futures_util::{SinkExt, StreamExt};
    use tracing::{error, info};

    #[derive(Clone)]
    struct AppState {
        bus: FrameBus,
        control: ControlHandle,
    }

    #[derive(Debug, Deserialize)]
    struct NewMarker {
        name: Option<String>,
        x: f64,
        y: f64,
    }

    #[derive(Debug, Deserialize)]
    struct MarkerName {
        name: String,
    }

    fn error_response(e: VisualizerError) -> Response {
        let status = match &e {
            VisualizerError::Pipeline(PipelineError::UnknownAlert(_)) => StatusCode::NOT_FOUND,
            VisualizerError::Pipeline(PipelineError::SessionClosed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string()).into_response()
    }

    async fn ws_meta(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| ws_conn(socket, state.bus))
    }

    // Meta goes out as JSON text, heatmap frames as binary PNG.
    async fn ws_conn(socket: WebSocket, bus: FrameBus) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let mut meta_rx = bus.meta_tx.subscribe();
        let mut frames_rx = bus.frames_tx.subscribe();
        loop {
            let outgoing = tokio::select! {
                meta = meta_rx.recv() => match meta {
                    Ok(meta) => match serde_json::to_string(&meta) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!("Failed to serialize meta: {}", e);
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                frame = frames_rx.recv() => match frame {
                    Ok(packet) => Message::Binary(packet.data.to_vec()),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                },
            };
            if ws_tx.send(outgoing).await.is_err() {
                break;
            }
        }
    }

    async fn set_visible(control: &ControlHandle, visible: bool) -> Response {
        match control.set_heatmap_visible(visible).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn heatmap_show(State(state): State<AppState>) -> Response {
        set_visible(&state.control, true).await
    }

    async fn heatmap_hide(State(state): State<AppState>) -> Response {
        set_visible(&state.control, false).await
    }

    async fn set_enabled(control: &ControlHandle, enabled: bool) -> Response {
        match control.set_heatmap_enabled(enabled).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn heatmap_enable(State(state): State<AppState>) -> Response {
        set_enabled(&state.control, true).await
    }

    async fn heatmap_disable(State(state): State<AppState>) -> Response {
        set_enabled(&state.control, false).await
    }

    async fn heatmap_opacity(State(state): State<AppState>, Path(opacity): Path<f64>) -> Response {
        match state.control.set_opacity(opacity).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn history(State(state): State<AppState>) -> Json<Vec<GlobalStats>> {
        Json(state.control.history().await)
    }

    async fn seek(State(state): State<AppState>, Path(query_ms): Path<u64>) -> Response {
        match state.control.seek(query_ms).await {
            Ok(Some(stats)) => Json(stats).into_response(),
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn resolve(State(state): State<AppState>, Path(id): Path<String>) -> Response {
        match state.control.resolve_alert(&id).await {
            Ok(update) => Json(update).into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn list_markers(State(state): State<AppState>) -> Json<Vec<ZoneMarker>> {
        Json(state.control.markers().await)
    }

    async fn add_marker(
        State(state): State<AppState>,
        Json(body): Json<NewMarker>,
    ) -> Json<ZoneMarker> {
        Json(
            state
                .control
                .add_marker(body.name.as_deref(), body.x, body.y)
                .await,
        )
    }

    async fn rename_marker(
        State(state): State<AppState>,
        Path(id): Path<u64>,
        Json(body): Json<MarkerName>,
    ) -> Response {
        match state.control.rename_marker(id, &body.name).await {
            Some(marker) => Json(marker).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn remove_marker(State(state): State<AppState>, Path(id): Path<u64>) -> StatusCode {
        match state.control.remove_marker(id).await {
            Some(_) => StatusCode::NO_CONTENT,
            None => StatusCode::NOT_FOUND,
        }
    }

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws/meta", get(ws_meta))
        .route("/control/heatmap/show", post(heatmap_show))
        .route("/control/heatmap/hide", post(heatmap_hide))
        .route("/control/heatmap/enable", post(heatmap_enable))
        .route("/control/heatmap/disable", post(heatmap_disable))
        .route("/control/heatmap/opacity/:value", post(heatmap_opacity))
        .route("/control/seek/:ms", post(seek))
        .route("/alerts/:id/resolve", post(resolve))
        .route("/markers", get(list_markers).post(add_marker))
        .route("/stats/history", get(history))
        .route("/markers/:id", put(rename_marker).delete(remove_marker))
        .with_state(AppState { bus, control });

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(
        bind = %cfg.bind_addr,
        refresh_ms = cfg.refresh_interval.as_millis() as u64,
        "Visualizer server listening"
    );
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Visualizer server stopped: {}", e);
        }
    });

    Ok(server)
}

#[cfg(not(feature = "web"))]
pub async fn start_server(
    _bus: FrameBus,
    _cfg: ServerConfig,
    _control: ControlHandle,
) -> anyhow::Result<JoinHandle<()>> {
    Err(anyhow::anyhow!(
        "web feature not enabled for crowd_pulse_visualizer"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crowd_pulse::{
        DensityPipeline, GridShape, LiveSessionConfig, PipelineConfig, RenderSettings, RiskLevel,
        TickReport,
    };

    fn stats() -> GlobalStats {
        GlobalStats {
            timestamp: 5,
            total_people: 12.0,
            global_density: 0.1,
            global_risk: RiskLevel::Low,
            max_density: 1.0,
        }
    }

    #[test]
    fn ticks_publish_png_frames_and_meta() {
        let bus = FrameBus::new(4);
        let mut frames = bus.frames_tx.subscribe();
        let mut meta = bus.meta_tx.subscribe();

        let report = TickReport {
            timestamp: 42,
            global: Some(stats()),
            heatmap: Some(RgbaImage::new(6, 4)),
            ..TickReport::default()
        };
        publish_update(&bus, SessionUpdate::Tick(Arc::new(report))).unwrap();

        let packet = frames.try_recv().unwrap();
        assert_eq!((packet.width, packet.height, packet.ts_millis), (6, 4, 42));
        assert_eq!(&packet.data[..8], b"\x89PNG\r\n\x1a\n");
        assert!(matches!(
            meta.try_recv().unwrap(),
            Meta::Tick { timestamp: 42, .. }
        ));
    }

    #[test]
    fn frames_are_not_encoded_without_listeners() {
        let bus = FrameBus::new(4);
        let mut meta = bus.meta_tx.subscribe();
        let report = TickReport {
            heatmap: Some(RgbaImage::new(2, 2)),
            ..TickReport::default()
        };
        publish_update(&bus, SessionUpdate::Tick(Arc::new(report))).unwrap();
        assert!(meta.try_recv().is_ok());
    }

    #[test]
    fn meta_is_tagged_json() {
        let json = serde_json::to_value(Meta::Stats { stats: stats() }).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["stats"]["totalPeople"], 12.0);

        let resolved = Meta::Alert {
            update: AlertUpdate::Resolved { id: "a-1".into() },
        };
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["update"]["type"], "resolved");
    }

    #[tokio::test(start_paused = true)]
    async fn control_handle_keeps_session_markers_in_sync() {
        let pipeline = DensityPipeline::new(PipelineConfig {
            shape: GridShape::new(4, 4),
            render: RenderSettings {
                width: 8,
                height: 8,
                blur_sigma: 0.0,
                ..RenderSettings::default()
            },
            ..PipelineConfig::default()
        });
        let session = Arc::new(LiveSession::spawn(pipeline, LiveSessionConfig::default()));
        let bus = FrameBus::new(16);
        let mut meta = bus.meta_tx.subscribe();
        let control = ControlHandle::new(Arc::clone(&session), bus);

        let gate = control.add_marker(Some("Gate"), 10.0, 20.0).await;
        let auto = control.add_marker(None, 50.0, 50.0).await;
        assert_eq!(auto.name, "ZONE 02");
        assert_eq!(control.markers().await.len(), 2);

        let renamed = control.rename_marker(gate.id, "North Gate").await.unwrap();
        assert_eq!(renamed.name, "North Gate");
        assert!(control.rename_marker(999, "Nowhere").await.is_none());
        assert_eq!(control.remove_marker(gate.id).await, Some(renamed));
        assert!(control.remove_marker(999).await.is_none());
        assert_eq!(control.markers().await, vec![auto]);

        let mut last = None;
        while let Ok(update) = meta.try_recv() {
            last = Some(update);
        }
        assert!(matches!(last, Some(Meta::Markers { markers }) if markers.len() == 1));

        assert!(matches!(
            control.resolve_alert("missing").await,
            Err(VisualizerError::Pipeline(PipelineError::UnknownAlert(_)))
        ));
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn control_handle_drives_overlay_and_reads_history() {
        let pipeline = DensityPipeline::new(PipelineConfig {
            shape: GridShape::new(2, 2),
            render: RenderSettings {
                width: 4,
                height: 4,
                blur_sigma: 0.0,
                ..RenderSettings::default()
            },
            ..PipelineConfig::default()
        });
        let session = Arc::new(LiveSession::spawn(pipeline, LiveSessionConfig::default()));
        let control = ControlHandle::new(Arc::clone(&session), FrameBus::new(4));

        session
            .push_json(r#"{ "grid": [0, 1, 2, 3], "stats": { "totalPeople": 7 } }"#)
            .await
            .unwrap();
        control.set_opacity(0.25).await.unwrap();
        control.set_heatmap_enabled(false).await.unwrap();
        // A seek round-trip lands after everything queued before it.
        control.seek(0).await.unwrap();

        let history = control.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_people, 7.0);
        {
            let pipeline = session.pipeline();
            let state = pipeline.lock().await;
            assert_eq!(state.heatmap_view().opacity(), 0.25);
            assert!(!state.heatmap_view().is_enabled());
        }
        session.shutdown().await;
    }

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr, "127.0.0.1:3001");
        assert_eq!(cfg.refresh_interval, Duration::from_millis(33));
    }
}
