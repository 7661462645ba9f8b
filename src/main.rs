// src/main.rs

mod annotate;
mod capture;
mod config;
mod detector;
mod error;
mod metrics;
mod pipeline;
mod preview;
mod streamer;
mod types;

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::types::Config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vision_streamer=info,ort=warn")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    info!("Capture source: {}", config.source);
    info!("Streaming destination: {}", config.stream.url());

    match pipeline::run(&config) {
        Ok(report) => {
            info!(
                "Session finished ({:?}): {} captured, {} pushed, {} degraded",
                report.stop, report.frames_captured, report.frames_pushed, report.frames_degraded
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Fatal initialization error: {err}");
            ExitCode::FAILURE
        }
    }
}
