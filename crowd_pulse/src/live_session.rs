// THEORY:
// A `LiveSession` runs a `DensityPipeline` against a real clock. Two activities
// share the pipeline: an inbox task that applies upstream messages and operator
// commands in arrival order, and a render task that ticks at the refresh rate.
// Both take the same `tokio::sync::Mutex`, so the pipeline still only ever sees
// one caller at a time and keeps its single-threaded semantics.
//
// Key architectural principles:
// 1.  **Ordered Inbox**: Everything that mutates the pipeline outside of a tick
//     goes through one mpsc channel. A live frame pushed before a seek is applied
//     before that seek.
// 2.  **Snapshot Inputs**: Zone markers are owned by the host. The session only
//     reads the latest set from a `watch` channel at the start of each tick.
// 3.  **Fan-out Outputs**: Tick reports, stats and alert changes are published on
//     a broadcast channel. Slow subscribers lag and skip; they never stall the
//     render loop.
// 4.  **Explicit Shutdown**: A `watch` flag stops both tasks, and `shutdown` awaits
//     them. Dropping the handle raises the flag as a best effort.

use crate::core_modules::alert_engine::AlertUpdate;
use crate::core_modules::density_frame::GlobalStats;
use crate::core_modules::normalizer::UpstreamMessage;
use crate::core_modules::zone_marker::ZoneMarker;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{DensityPipeline, IngestOutcome, TickReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Timing and channel sizing for a live session.
#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    /// Render loop period.
    pub refresh_interval: Duration,
    /// Pending upstream messages and commands before `push` waits.
    pub inbox_capacity: usize,
    /// Updates buffered per subscriber before it starts lagging.
    pub updates_capacity: usize,
}

impl Default for LiveSessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(33),
            inbox_capacity: 64,
            updates_capacity: 64,
        }
    }
}

/// Everything a session publishes.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Output of one render tick.
    Tick(Arc<TickReport>),
    /// A live frame or a seek hit became the current frame.
    Stats(GlobalStats),
    /// An alert was raised or resolved.
    Alert(AlertUpdate),
}

enum SessionCommand {
    Upstream(UpstreamMessage),
    UpstreamJson(String),
    Seek(u64, oneshot::Sender<Option<GlobalStats>>),
    Resolve(String, oneshot::Sender<PipelineResult<AlertUpdate>>),
    SetHeatmapVisible(bool),
    SetHeatmapEnabled(bool),
    SetOpacity(f64),
}

/// Milliseconds since the session started.
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    started: Instant,
}

impl SessionClock {
    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Handle to a running session.
pub struct LiveSession {
    pipeline: Arc<Mutex<DensityPipeline>>,
    commands: mpsc::Sender<SessionCommand>,
    markers: watch::Sender<Vec<ZoneMarker>>,
    updates: broadcast::Sender<SessionUpdate>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveSession {
    /// Starts the inbox and render tasks on the current runtime.
    pub fn spawn(pipeline: DensityPipeline, config: LiveSessionConfig) -> Self {
        let pipeline = Arc::new(Mutex::new(pipeline));
        let (commands, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let (markers, markers_rx) = watch::channel(Vec::new());
        let (updates, _) = broadcast::channel(config.updates_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let clock = SessionClock {
            started: Instant::now(),
        };

        let inbox_task = tokio::spawn(run_inbox(
            Arc::clone(&pipeline),
            inbox,
            updates.clone(),
            clock,
            shutdown_rx.clone(),
        ));
        let render_task = tokio::spawn(run_render_loop(
            Arc::clone(&pipeline),
            markers_rx,
            updates.clone(),
            clock,
            config.refresh_interval,
            shutdown_rx,
        ));
        info!(
            refresh_ms = config.refresh_interval.as_millis() as u64,
            "Live session started"
        );

        Self {
            pipeline,
            commands,
            markers,
            updates,
            shutdown,
            tasks: Mutex::new(vec![inbox_task, render_task]),
        }
    }

    /// Queues one upstream message. Malformed messages are dropped by the session.
    pub async fn push(&self, message: UpstreamMessage) -> PipelineResult<()> {
        self.send(SessionCommand::Upstream(message)).await
    }

    /// Queues one raw JSON upstream message.
    pub async fn push_json(&self, raw: impl Into<String>) -> PipelineResult<()> {
        self.send(SessionCommand::UpstreamJson(raw.into())).await
    }

    /// Replaces the marker set used from the next tick on.
    pub fn set_markers(&self, markers: Vec<ZoneMarker>) {
        self.markers.send_replace(markers);
    }

    /// Seeks the playback buffer. Returns the promoted frame's stats on a hit.
    pub async fn seek(&self, query_ms: u64) -> PipelineResult<Option<GlobalStats>> {
        let (reply, answer) = oneshot::channel();
        self.send(SessionCommand::Seek(query_ms, reply)).await?;
        answer.await.map_err(|_| PipelineError::SessionClosed)
    }

    pub async fn resolve_alert(&self, id: impl Into<String>) -> PipelineResult<AlertUpdate> {
        let (reply, answer) = oneshot::channel();
        self.send(SessionCommand::Resolve(id.into(), reply)).await?;
        answer.await.map_err(|_| PipelineError::SessionClosed)?
    }

    pub async fn set_heatmap_visible(&self, visible: bool) -> PipelineResult<()> {
        self.send(SessionCommand::SetHeatmapVisible(visible)).await
    }

    /// Master switch for the overlay. A disabled overlay keeps smoothing.
    pub async fn set_heatmap_enabled(&self, enabled: bool) -> PipelineResult<()> {
        self.send(SessionCommand::SetHeatmapEnabled(enabled)).await
    }

    /// Overlay opacity, clamped into [0,1].
    pub async fn set_opacity(&self, opacity: f64) -> PipelineResult<()> {
        self.send(SessionCommand::SetOpacity(opacity)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Shared access to the pipeline, for read-only inspection by the host.
    pub fn pipeline(&self) -> Arc<Mutex<DensityPipeline>> {
        Arc::clone(&self.pipeline)
    }

    /// Stops both tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                debug!("Session task ended abnormally: {}", e);
            }
        }
        info!("Live session stopped");
    }

    async fn send(&self, command: SessionCommand) -> PipelineResult<()> {
        if *self.shutdown.borrow() {
            return Err(PipelineError::SessionClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| PipelineError::SessionClosed)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        // Best effort shutdown on drop
        let _ = self.shutdown.send(true);
    }
}

async fn run_inbox(
    pipeline: Arc<Mutex<DensityPipeline>>,
    mut inbox: mpsc::Receiver<SessionCommand>,
    updates: broadcast::Sender<SessionUpdate>,
    clock: SessionClock,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = inbox.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let mut state = pipeline.lock().await;
        let now = clock.now();
        match command {
            SessionCommand::Upstream(message) => {
                if let Ok(outcome) = state.ingest(message, now) {
                    publish_outcome(&updates, outcome);
                }
            }
            SessionCommand::UpstreamJson(raw) => {
                if let Ok(outcome) = state.ingest_json(&raw, now) {
                    publish_outcome(&updates, outcome);
                }
            }
            SessionCommand::Seek(query_ms, reply) => {
                let hit = state.seek(query_ms, now).map(|hit| {
                    publish_outcome(
                        &updates,
                        IngestOutcome::Live {
                            stats: hit.stats.clone(),
                            alert: hit.alert,
                        },
                    );
                    hit.stats
                });
                let _ = reply.send(hit);
            }
            SessionCommand::Resolve(id, reply) => {
                let result = state.resolve_alert(&id);
                if let Ok(update) = &result {
                    let _ = updates.send(SessionUpdate::Alert(update.clone()));
                }
                let _ = reply.send(result);
            }
            SessionCommand::SetHeatmapVisible(visible) => state.set_heatmap_visible(visible),
            SessionCommand::SetHeatmapEnabled(enabled) => state.set_heatmap_enabled(enabled),
            SessionCommand::SetOpacity(opacity) => state.set_opacity(opacity),
        }
    }
    debug!("Session inbox closed");
}

async fn run_render_loop(
    pipeline: Arc<Mutex<DensityPipeline>>,
    markers: watch::Receiver<Vec<ZoneMarker>>,
    updates: broadcast::Sender<SessionUpdate>,
    clock: SessionClock,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let markers = markers.borrow().clone();
        let report = pipeline.lock().await.tick(&markers, clock.now());
        for alert in &report.alerts {
            let _ = updates.send(SessionUpdate::Alert(AlertUpdate::Raised(alert.clone())));
        }
        // No subscribers is fine.
        let _ = updates.send(SessionUpdate::Tick(Arc::new(report)));
    }
    debug!("Render loop stopped");
}

fn publish_outcome(updates: &broadcast::Sender<SessionUpdate>, outcome: IngestOutcome) {
    if let IngestOutcome::Live { stats, alert } = outcome {
        let _ = updates.send(SessionUpdate::Stats(stats));
        if let Some(alert) = alert {
            let _ = updates.send(SessionUpdate::Alert(AlertUpdate::Raised(alert)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::core_modules::alert_engine::{AlertEvent, AlertKind};
    use crate::core_modules::density_frame::GridShape;
    use crate::core_modules::heatmap_renderer::RenderSettings;
    use crate::core_modules::normalizer::UpstreamStats;
    use tokio::sync::broadcast::error::RecvError;

    fn session() -> LiveSession {
        let pipeline = DensityPipeline::new(PipelineConfig {
            shape: GridShape::new(10, 10),
            render: RenderSettings {
                width: 20,
                height: 20,
                blur_sigma: 0.0,
                ..RenderSettings::default()
            },
            ..PipelineConfig::default()
        });
        LiveSession::spawn(
            pipeline,
            LiveSessionConfig {
                refresh_interval: Duration::from_millis(100),
                inbox_capacity: 8,
                updates_capacity: 256,
            },
        )
    }

    fn frame(fill: f64, risk: &str) -> UpstreamMessage {
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

    async fn next_raised(
        updates: &mut broadcast::Receiver<SessionUpdate>,
        kind: AlertKind,
    ) -> AlertEvent {
        loop {
            match updates.recv().await {
                Ok(SessionUpdate::Alert(AlertUpdate::Raised(alert))) if alert.kind == kind => {
                    return alert;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("session closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn live_frames_are_published_and_rendered() {
        let session = session();
        let mut updates = session.subscribe();
        session.push(frame(0.2, "low")).await.unwrap();

        let mut saw_stats = false;
        let mut saw_heatmap = false;
        while !(saw_stats && saw_heatmap) {
            match updates.recv().await.unwrap() {
                SessionUpdate::Stats(stats) => {
                    assert_eq!(stats.total_people, 20.0);
                    saw_stats = true;
                }
                SessionUpdate::Tick(report) => saw_heatmap |= report.heatmap.is_some(),
                SessionUpdate::Alert(_) => {}
            }
        }
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_zone_risk_reaches_subscribers() {
        let session = session();
        let mut updates = session.subscribe();
        session.set_markers(vec![ZoneMarker::new(1, "Gate", 50.0, 50.0)]);
        session.push(frame(0.9, "low")).await.unwrap();

        let alert = tokio::time::timeout(
            Duration::from_secs(10),
            next_raised(&mut updates, AlertKind::SustainedRisk),
        )
        .await
        .unwrap();
        assert!(alert.timestamp >= 3_000);
        assert_eq!(alert.zone_id, Some(1));

        let update = session.resolve_alert(alert.id.clone()).await.unwrap();
        assert_eq!(update, AlertUpdate::Resolved { id: alert.id });
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn global_alert_is_published_on_ingest() {
        let session = session();
        let mut updates = session.subscribe();
        session.push(frame(0.9, "critical")).await.unwrap();

        let alert = next_raised(&mut updates, AlertKind::GlobalRisk).await;
        assert_eq!(alert.severity, crate::core_modules::risk::RiskLevel::Critical);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_do_not_stop_the_session() {
        let session = session();
        let mut updates = session.subscribe();
        session.push_json("{ definitely not json").await.unwrap();
        session.push(frame(0.2, "low")).await.unwrap();

        loop {
            if let SessionUpdate::Stats(stats) = updates.recv().await.unwrap() {
                assert_eq!(stats.total_people, 20.0);
                break;
            }
        }
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn seek_goes_through_the_inbox() {
        let session = session();
        let recorded = UpstreamMessage {
            t_ms: Some(1_000.0),
            ..frame(0.3, "low")
        };
        session.push(recorded).await.unwrap();

        let hit = session.seek(1_200).await.unwrap().unwrap();
        assert_eq!(hit.timestamp, 1_000);
        assert!(session.seek(5_000).await.unwrap().is_none());
        assert!(matches!(
            session.resolve_alert("missing").await,
            Err(PipelineError::UnknownAlert(_))
        ));
        session.shutdown().await;
    }

    async fn next_tick(updates: &mut broadcast::Receiver<SessionUpdate>) -> Arc<TickReport> {
        loop {
            match updates.recv().await {
                Ok(SessionUpdate::Tick(report)) => return report,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("session closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_toggles_reach_the_render_loop() {
        let session = session();
        session.push(frame(0.9, "low")).await.unwrap();
        session.set_opacity(0.5).await.unwrap();
        session.set_heatmap_enabled(false).await.unwrap();
        // Inbox commands apply in order, so a seek round-trip flushes the toggles.
        session.seek(0).await.unwrap();
        {
            let pipeline = session.pipeline();
            let state = pipeline.lock().await;
            assert_eq!(state.heatmap_view().opacity(), 0.5);
            assert!(!state.heatmap_view().is_enabled());
        }

        let mut updates = session.subscribe();
        assert!(next_tick(&mut updates).await.heatmap.is_none());

        session.set_heatmap_enabled(true).await.unwrap();
        session.seek(0).await.unwrap();
        let mut updates = session.subscribe();
        let heatmap = next_tick(&mut updates).await.heatmap.clone().unwrap();
        // Full-alpha cells are 0.9 * 255, halved by the opacity.
        assert_eq!(heatmap.get_pixel(10, 10).0[3], 115);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closed_sessions_reject_input() {
        let session = session();
        session.shutdown().await;
        assert!(matches!(
            session.push(frame(0.2, "low")).await,
            Err(PipelineError::SessionClosed)
        ));
        assert!(matches!(
            session.seek(0).await,
            Err(PipelineError::SessionClosed)
        ));
    }
}
