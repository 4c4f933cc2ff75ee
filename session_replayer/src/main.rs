use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use crowd_pulse::{
    AlertEvent, DensityPipeline, IngestOutcome, PipelineConfig, Ramp, SyntheticStream,
    TickReport, UpstreamMessage, ZoneMarkerSet,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Replay a crowd density session offline.
#[derive(Parser, Debug)]
#[command(name = "session_replayer")]
#[command(about = "Replay upstream density messages and write heatmaps and alerts")]
struct Cli {
    /// Directory for `heatmap_NNNNN.png` frames and `alerts.jsonl`.
    output_dir: PathBuf,

    /// Upstream messages, one JSON object per line.
    #[arg(long, required_unless_present = "synthetic", conflicts_with = "synthetic")]
    input: Option<PathBuf>,

    /// Generate this many synthetic messages instead of reading a file.
    #[arg(long)]
    synthetic: Option<u64>,

    /// JSON array of `{ "name": ..., "x": ..., "y": ... }` zone markers.
    #[arg(long)]
    markers: Option<PathBuf>,

    /// JSON pipeline config. Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated render loop period.
    #[arg(long, default_value_t = 33)]
    tick_ms: u64,

    /// Spacing of live messages that carry no timestamp.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Write every Nth rendered frame.
    #[arg(long, default_value_t = 30)]
    every: u64,

    /// Seek the playback buffer to these positions after the input ends.
    #[arg(long)]
    seek: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct MarkerSpec {
    #[serde(default)]
    name: Option<String>,
    x: f64,
    y: f64,
}

#[derive(Debug, Default, PartialEq)]
struct ReplaySummary {
    live: u64,
    buffered: u64,
    malformed: u64,
    ticks: u64,
    frames_written: u64,
    alerts: u64,
    seek_hits: u64,
    /// Over the retained stats history.
    mean_density: Option<f64>,
    peak_people: Option<f64>,
}

/// Where rendered frames and alerts go.
trait ReplaySink {
    fn frame(&mut self, index: u64, report: &TickReport) -> Result<bool>;
    fn alert(&mut self, alert: &AlertEvent) -> Result<()>;
}

struct DirectorySink {
    dir: PathBuf,
    alerts: BufWriter<File>,
}

impl DirectorySink {
    fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let alerts_path = dir.join("alerts.jsonl");
        let alerts = File::create(&alerts_path)
            .with_context(|| format!("creating {}", alerts_path.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            alerts: BufWriter::new(alerts),
        })
    }
}

impl ReplaySink for DirectorySink {
    fn frame(&mut self, index: u64, report: &TickReport) -> Result<bool> {
        let Some(heatmap) = &report.heatmap else {
            return Ok(false);
        };
        let path = self.dir.join(format!("heatmap_{index:05}.png"));
        heatmap
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(true)
    }

    fn alert(&mut self, alert: &AlertEvent) -> Result<()> {
        serde_json::to_writer(&mut self.alerts, alert)?;
        self.alerts.write_all(b"\n")?;
        Ok(())
    }
}

impl Drop for DirectorySink {
    fn drop(&mut self) {
        let _ = self.alerts.flush();
    }
}

/// Drives a pipeline on a simulated clock.
struct Replay<S: ReplaySink> {
    pipeline: DensityPipeline,
    markers: ZoneMarkerSet,
    sink: S,
    tick_ms: u64,
    interval_ms: u64,
    every: u64,
    /// Simulated milliseconds since the first message.
    now: u64,
    next_tick: u64,
    /// Timestamp of the first live message, used as the clock origin.
    origin: Option<u64>,
    summary: ReplaySummary,
}

impl<S: ReplaySink> Replay<S> {
    fn new(pipeline: DensityPipeline, markers: ZoneMarkerSet, sink: S, cli: &Cli) -> Self {
        Self {
            pipeline,
            markers,
            sink,
            tick_ms: cli.tick_ms.max(1),
            interval_ms: cli.interval_ms.max(1),
            every: cli.every.max(1),
            now: 0,
            next_tick: 0,
            origin: None,
            summary: ReplaySummary::default(),
        }
    }

    /// Ticks until the simulated clock reaches the message, then ingests it.
    fn feed(&mut self, message: UpstreamMessage) -> Result<()> {
        if !message.is_replay() {
            let at = match message.timestamp {
                Some(ts) if ts.is_finite() && ts >= 0.0 => {
                    let ts = ts.round() as u64;
                    let origin = *self.origin.get_or_insert(ts);
                    ts.saturating_sub(origin).max(self.now)
                }
                _ if self.summary.live == 0 => self.now,
                _ => self.now + self.interval_ms,
            };
            self.advance_to(at)?;
        }

        match self.pipeline.ingest(message, self.now) {
            Ok(IngestOutcome::Live { alert, .. }) => {
                self.summary.live += 1;
                if let Some(alert) = alert {
                    self.record_alert(&alert)?;
                }
            }
            Ok(IngestOutcome::Buffered { .. }) => self.summary.buffered += 1,
            Err(_) => self.summary.malformed += 1,
        }
        Ok(())
    }

    fn feed_line(&mut self, line: &str) -> Result<()> {
        match serde_json::from_str::<UpstreamMessage>(line) {
            Ok(message) => self.feed(message),
            Err(e) => {
                warn!("Skipping undecodable line: {}", e);
                self.summary.malformed += 1;
                Ok(())
            }
        }
    }

    fn advance_to(&mut self, at: u64) -> Result<()> {
        while self.next_tick <= at {
            self.now = self.next_tick;
            self.tick()?;
            self.next_tick += self.tick_ms;
        }
        self.now = at;
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        let report = self.pipeline.tick(self.markers.as_slice(), self.now);
        if self.summary.ticks % self.every == 0 && self.sink.frame(self.summary.ticks, &report)? {
            self.summary.frames_written += 1;
        }
        self.summary.ticks += 1;
        for alert in &report.alerts {
            self.record_alert(alert)?;
        }
        Ok(())
    }

    fn seek(&mut self, query_ms: u64) -> Result<()> {
        match self.pipeline.seek(query_ms, self.now) {
            Some(hit) => {
                self.summary.seek_hits += 1;
                if let Some(alert) = hit.alert {
                    self.record_alert(&alert)?;
                }
                info!(query_ms, frame = hit.frame.timestamp, "Seek hit");
                let report = self.pipeline.tick(self.markers.as_slice(), self.now);
                if self.sink.frame(self.summary.ticks, &report)? {
                    self.summary.frames_written += 1;
                }
                self.summary.ticks += 1;
                for alert in &report.alerts {
                    self.record_alert(alert)?;
                }
            }
            None => info!(query_ms, "Seek missed; nothing recorded close enough"),
        }
        Ok(())
    }

    fn record_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        self.summary.alerts += 1;
        self.sink.alert(alert)
    }

    fn finish(mut self) -> ReplaySummary {
        let history = self.pipeline.history();
        self.summary.mean_density = history.mean_density();
        self.summary.peak_people = history.peak_people();
        self.summary
    }
}

fn load_markers(path: Option<&Path>) -> Result<ZoneMarkerSet> {
    let mut markers = ZoneMarkerSet::new();
    if let Some(path) = path {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let specs: Vec<MarkerSpec> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        for spec in &specs {
            markers.add(spec.name.as_deref(), spec.x, spec.y);
        }
    }
    Ok(markers)
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => {
            let raw =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in ["crowd_pulse=warn", "session_replayer=info"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .init();
    }
}

fn main() -> Result<()> {
    init_tracing();

    // --- 1. Argument Parsing & Setup ---
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let markers = load_markers(cli.markers.as_deref())?;
    info!(markers = markers.len(), "Replay starting");

    // --- 2. Pipeline Initialization ---
    let shape = config.shape;
    let pipeline = DensityPipeline::new(config);
    let sink = DirectorySink::create(&cli.output_dir)?;
    let mut replay = Replay::new(pipeline, markers, sink, &cli);

    // --- 3. Main Processing Loop ---
    match (&cli.input, cli.synthetic) {
        (Some(input), _) => {
            let file =
                File::open(input).with_context(|| format!("opening {}", input.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if !line.trim().is_empty() {
                    replay.feed_line(&line)?;
                }
            }
        }
        (None, Some(count)) => {
            let stream = SyntheticStream::new(shape, cli.interval_ms).with_ramp(Ramp {
                start: 1.0,
                end: 3.0,
                frames: (count / 2).max(1),
            });
            for message in stream.take(count as usize) {
                replay.feed(message)?;
            }
        }
        (None, None) => anyhow::bail!("either --input or --synthetic is required"),
    }

    // --- 4. Drain & Seek ---
    // One more interval so the last message gets rendered.
    let end = replay.now + cli.interval_ms;
    replay.advance_to(end)?;
    for &query_ms in &cli.seek {
        replay.seek(query_ms)?;
    }

    let summary = replay.finish();
    info!(
        live = summary.live,
        buffered = summary.buffered,
        malformed = summary.malformed,
        ticks = summary.ticks,
        frames = summary.frames_written,
        alerts = summary.alerts,
        seek_hits = summary.seek_hits,
        mean_density = summary.mean_density.unwrap_or(0.0),
        peak_people = summary.peak_people.unwrap_or(0.0),
        "Replay complete. Output saved to {}",
        cli.output_dir.display()
    );
    Ok(())
}
