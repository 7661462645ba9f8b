// src/types.rs

use std::fmt;

/// One decoded image buffer. Pixel layout is fixed BGR24 (3 bytes per pixel,
/// byte-interleaved), matching both the capture backend and the raw-video
/// input the encoder process expects.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub index: u64,
}

impl Frame {
    /// Expected buffer length for the declared dimensions.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Axis-aligned bounding box in frame coordinates. `x1 < x2`, `y1 < y2` is
/// only guaranteed after `clamp_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.round() as i32,
            y1: y1.round() as i32,
            x2: x2.round() as i32,
            y2: y2.round() as i32,
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Clamp the box into `[0, width) x [0, height)`. Returns `None` when the
    /// clamped box would be empty (fully outside the frame or degenerate), so
    /// no drawing call ever sees out-of-range coordinates.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;
        let clamped = BoundingBox {
            x1: self.x1.clamp(0, max_x),
            y1: self.y1.clamp(0, max_y),
            x2: self.x2.clamp(0, max_x),
            y2: self.y2.clamp(0, max_y),
        };
        if clamped.x1 < clamped.x2 && clamped.y1 < clamped.y2 {
            Some(clamped)
        } else {
            None
        }
    }
}

/// A single model output for one frame. No identity across frames.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Result of the per-frame processing step. Inference and annotation failures
/// are cosmetic: the frame is still forwarded, carrying the reason it was
/// degraded instead of silently dropping the failure.
#[derive(Debug)]
pub enum FrameOutcome {
    Annotated(Frame),
    Degraded { frame: Frame, reason: String },
}

/// Capture source identifier: a numeric device index or a path/URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceId {
    Device(i32),
    Uri(String),
}

impl SourceId {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i32>() {
            Ok(index) => SourceId::Device(index),
            Err(_) => SourceId::Uri(raw.to_string()),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Device(index) => write!(f, "{index}"),
            SourceId::Uri(uri) => write!(f, "{uri}"),
        }
    }
}

/// Post-push pacing behaviour. `Fixed` sleeps the full frame interval after
/// every push (legacy parity; actual throughput drifts below the target as
/// processing time grows). `Deadline` sleeps only the remainder of the
/// interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    Fixed,
    Deadline,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceId,
    pub stream: StreamConfig,
    pub model: ModelConfig,
    pub video: VideoConfig,
    pub encoder: EncoderSettings,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub url_override: Option<String>,
}

impl StreamConfig {
    /// Destination URL; an explicit `RTSP_URL` wins over the composed form.
    pub fn url(&self) -> String {
        match &self.url_override {
            Some(url) => url.clone(),
            None => format!("rtsp://{}:{}/{}", self.host, self.port, self.path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub path: String,
    pub device: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub fps: u32,
    pub show_preview: bool,
    pub pacing: PacingMode,
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub preset: String,
    pub tune: String,
    pub crf: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            tune: "zerolatency".to_string(),
            crf: 23,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_byte_len() {
        let frame = Frame {
            data: vec![0; 640 * 480 * 3],
            width: 640,
            height: 480,
            index: 0,
        };
        assert_eq!(frame.byte_len(), frame.data.len());
    }

    #[test]
    fn test_bbox_clamped_inside_frame() {
        let bbox = BoundingBox::from_corners(-20.0, 10.0, 120.0, 700.0);
        let clamped = bbox.clamp_to(100, 100).unwrap();
        assert_eq!(clamped, BoundingBox { x1: 0, y1: 10, x2: 99, y2: 99 });
    }

    #[test]
    fn test_bbox_fully_outside_is_dropped() {
        let bbox = BoundingBox::from_corners(200.0, 200.0, 300.0, 300.0);
        assert!(bbox.clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_bbox_degenerate_is_dropped() {
        let bbox = BoundingBox::from_corners(50.0, 50.0, 50.0, 80.0);
        assert!(bbox.clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_source_id_parse() {
        assert_eq!(SourceId::parse("0"), SourceId::Device(0));
        assert_eq!(SourceId::parse(" 2 "), SourceId::Device(2));
        assert_eq!(
            SourceId::parse("rtsp://cam.local/feed"),
            SourceId::Uri("rtsp://cam.local/feed".to_string())
        );
        assert_eq!(
            SourceId::parse("videos/test.mp4"),
            SourceId::Uri("videos/test.mp4".to_string())
        );
    }

    #[test]
    fn test_stream_url_composition() {
        let stream = StreamConfig {
            host: "mediamtx".to_string(),
            port: 8554,
            path: "mystream".to_string(),
            url_override: None,
        };
        assert_eq!(stream.url(), "rtsp://mediamtx:8554/mystream");
    }

    #[test]
    fn test_stream_url_override_wins() {
        let stream = StreamConfig {
            host: "mediamtx".to_string(),
            port: 8554,
            path: "mystream".to_string(),
            url_override: Some("rtsp://other:1234/live".to_string()),
        };
        assert_eq!(stream.url(), "rtsp://other:1234/live");
    }

    #[test]
    fn test_encoder_defaults() {
        let settings = EncoderSettings::default();
        assert_eq!(settings.preset, "veryfast");
        assert_eq!(settings.tune, "zerolatency");
        assert_eq!(settings.crf, 23);
    }
}
