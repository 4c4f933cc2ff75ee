//! Runs a live session fed by upstream JSON lines on stdin and serves it over HTTP.

use std::sync::Arc;

use crowd_pulse::{DensityPipeline, LiveSession, LiveSessionConfig, PipelineConfig};
use crowd_pulse_visualizer::{ControlHandle, FrameBus, ServerConfig, forward_updates, start_server};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in ["crowd_pulse=info", "crowd_pulse_visualizer=info"] {
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
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = ServerConfig::from_env();
    let pipeline = DensityPipeline::new(PipelineConfig::from_env());
    let session = Arc::new(LiveSession::spawn(
        pipeline,
        LiveSessionConfig {
            refresh_interval: cfg.refresh_interval,
            ..LiveSessionConfig::default()
        },
    ));

    let bus = FrameBus::new(4);
    let forwarder = forward_updates(bus.clone(), &session);
    let control = ControlHandle::new(Arc::clone(&session), bus.clone());
    let server = start_server(bus, cfg, control).await?;

    // Upstream messages, one JSON object per line.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    session.push_json(line).await?;
                    accepted += 1;
                }
                None => {
                    info!(accepted, "Upstream stream ended; still serving");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    info!("Shutting down");
    session.shutdown().await;
    server.abort();
    forwarder.abort();
    Ok(())
}
