// src/capture.rs

use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{info, warn};

use crate::error::CaptureError;
use crate::types::{Frame, SourceId};

/// Fallback when the device reports zero for a dimension.
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

/// Sequential frame provider. `read_frame` blocks until a frame is available
/// and never buffers ahead; `None` signals end of stream.
pub trait VideoSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
    fn resolution(&self) -> (u32, u32);
    fn release(&mut self);
}

pub struct Capture {
    cap: VideoCapture,
    width: u32,
    height: u32,
    next_index: u64,
    released: bool,
}

impl Capture {
    pub fn open(source: &SourceId) -> Result<Self, CaptureError> {
        info!("Opening capture source: {}", source);

        let cap = match source {
            SourceId::Device(index) => VideoCapture::new(*index, videoio::CAP_ANY),
            SourceId::Uri(uri) => VideoCapture::from_file(uri, videoio::CAP_ANY),
        }
        .map_err(|err| CaptureError::Open {
            source: source.to_string(),
            reason: err.to_string(),
        })?;

        let opened = cap.is_opened().map_err(|err| CaptureError::Open {
            source: source.to_string(),
            reason: err.to_string(),
        })?;
        if !opened {
            return Err(CaptureError::Open {
                source: source.to_string(),
                reason: "device or file could not be opened".to_string(),
            });
        }

        let reported_width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)
            .unwrap_or(0.0);
        let reported_height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)
            .unwrap_or(0.0);
        let (width, height) = resolve_dimensions(reported_width, reported_height);

        info!("Capture ready: {}x{}", width, height);

        Ok(Self {
            cap,
            width,
            height,
            next_index: 0,
            released: false,
        })
    }
}

impl VideoSource for Capture {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut mat = Mat::default();

        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        let data = mat.data_bytes()?.to_vec();
        let index = self.next_index;
        self.next_index += 1;

        // Actual decoded dimensions, not the reported ones: a mismatch with
        // the stream session must surface at the push contract.
        Ok(Some(Frame {
            data,
            width: mat.cols() as u32,
            height: mat.rows() as u32,
            index,
        }))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = VideoCaptureTrait::release(&mut self.cap) {
            warn!("Failed to release capture device: {err}");
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        VideoSource::release(self);
    }
}

fn resolve_dimensions(reported_width: f64, reported_height: f64) -> (u32, u32) {
    let width = if reported_width as u32 == 0 {
        DEFAULT_WIDTH
    } else {
        reported_width as u32
    };
    let height = if reported_height as u32 == 0 {
        DEFAULT_HEIGHT
    } else {
        reported_height as u32
    };
    (width, height)
}
