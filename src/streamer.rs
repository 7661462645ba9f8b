// src/streamer.rs
//
// Owns the external encoder process: raw BGR24 frames go in on its stdin,
// the encoded stream comes out at the destination URL. The blocking pipe
// write is the pipeline's only backpressure mechanism.

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::types::{EncoderSettings, Frame};

/// How long `close` waits for the encoder to flush and exit after stdin EOF.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const CLOSE_POLL: Duration = Duration::from_millis(50);

/// Destination for annotated frames. The resolution is fixed at open time
/// and every pushed frame must match it exactly.
pub trait FrameSink {
    fn push(&mut self, frame: &Frame) -> Result<(), StreamError>;
    fn close(&mut self);
}

pub struct StreamEncoder {
    width: u32,
    height: u32,
    url: String,
    child: Child,
    stdin: Option<ChildStdin>,
    closed: bool,
}

impl StreamEncoder {
    /// Spawn the encoder process. The process is assumed ready to consume
    /// input immediately after spawn; no readiness probe is performed.
    pub fn open(
        width: u32,
        height: u32,
        fps: u32,
        url: &str,
        settings: &EncoderSettings,
    ) -> Result<Self, StreamError> {
        let args = ffmpeg_args(width, height, fps, url, settings);
        info!("Starting encoder: ffmpeg {}", args.join(" "));

        let mut cmd = Command::new("ffmpeg");
        cmd.args(&args);
        Self::spawn(cmd, width, height, url.to_string())
    }

    fn spawn(mut cmd: Command, width: u32, height: u32, url: String) -> Result<Self, StreamError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(StreamError::Start)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            StreamError::Start(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder stdin was not captured",
            ))
        })?;

        Ok(Self {
            width,
            height,
            url,
            child,
            stdin: Some(stdin),
            closed: false,
        })
    }
}

impl FrameSink for StreamEncoder {
    fn push(&mut self, frame: &Frame) -> Result<(), StreamError> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(StreamError::Mismatch {
                frame_width: frame.width,
                frame_height: frame.height,
                stream_width: self.width,
                stream_height: self.height,
            });
        }

        let stdin = self.stdin.as_mut().ok_or(StreamError::BrokenPipe)?;
        stdin.write_all(&frame.data).map_err(|err| {
            if err.kind() == io::ErrorKind::BrokenPipe {
                StreamError::BrokenPipe
            } else {
                StreamError::Write(err)
            }
        })
    }

    /// Close the input pipe so the encoder can flush and finalise, then wait
    /// for it to exit within a bounded grace window. Never escalates to a
    /// hard kill; a stuck encoder is left to the OS. Safe to call repeatedly.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        drop(self.stdin.take());

        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Encoder process exited: {status}");
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(CLOSE_POLL),
                Ok(None) => {
                    warn!(
                        "Encoder for {} still running after {CLOSE_GRACE:?}; leaving it to the OS",
                        self.url
                    );
                    break;
                }
                Err(err) => {
                    warn!("Failed to poll encoder process: {err}");
                    break;
                }
            }
        }
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        self.close();
    }
}

fn ffmpeg_args(
    width: u32,
    height: u32,
    fps: u32,
    url: &str,
    settings: &EncoderSettings,
) -> Vec<String> {
    let size = format!("{width}x{height}");
    let rate = fps.to_string();
    let crf = settings.crf.to_string();
    [
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
        "-s",
        size.as_str(),
        "-r",
        rate.as_str(),
        "-i",
        "-",
        "-c:v",
        "libx264",
        "-preset",
        settings.preset.as_str(),
        "-tune",
        settings.tune.as_str(),
        "-crf",
        crf.as_str(),
        "-f",
        "rtsp",
        "-rtsp_transport",
        "tcp",
        url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
