// src/error.rs

use std::io;

use thiserror::Error;

/// Capture-side failures. Only `Open` is fatal; a failed read mid-stream is
/// handled as end-of-input by the controller.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture source `{source}`: {reason}")]
    Open { source: String, reason: String },

    #[error("capture read failed: {0}")]
    Read(#[from] opencv::Error),
}

/// Encoder-side failures. Every variant is session-ending: the pipeline never
/// retries a broken pipe or restarts the encoder process.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to start encoder process: {0}")]
    Start(#[source] io::Error),

    #[error("encoder pipe closed by downstream")]
    BrokenPipe,

    #[error("failed to write frame to encoder: {0}")]
    Write(#[source] io::Error),

    #[error(
        "frame is {frame_width}x{frame_height} but the stream was opened at \
         {stream_width}x{stream_height}"
    )]
    Mismatch {
        frame_width: u32,
        frame_height: u32,
        stream_width: u32,
        stream_height: u32,
    },
}

/// Initialization-phase umbrella. `main` maps any of these to a non-zero
/// exit code; fatal errors after `Running` are reported through the normal
/// drain path instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("detector initialisation failed: {0:#}")]
    Init(anyhow::Error),
}
