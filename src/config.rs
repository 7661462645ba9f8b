// src/config.rs

use anyhow::{ensure, Context, Result};

use crate::types::{
    Config, EncoderSettings, ModelConfig, PacingMode, SourceId, StreamConfig, VideoConfig,
};

impl Config {
    /// Load the configuration from environment variables. Every key is
    /// optional and falls back to its documented default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable lookup, so parsing is
    /// testable without touching process-global state.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let source = SourceId::parse(&get("INPUT_SOURCE").unwrap_or_else(|| "0".to_string()));

        let host = get("RTSP_HOST").unwrap_or_else(|| "mediamtx".to_string());
        let port = get("RTSP_PORT")
            .unwrap_or_else(|| "8554".to_string())
            .parse::<u16>()
            .context("RTSP_PORT must be a port number")?;
        let path = get("RTSP_PATH").unwrap_or_else(|| "mystream".to_string());
        let stream = StreamConfig {
            host,
            port,
            path,
            url_override: get("RTSP_URL"),
        };

        let confidence_threshold = get("YOLO_CONFIDENCE")
            .unwrap_or_else(|| "0.25".to_string())
            .parse::<f32>()
            .context("YOLO_CONFIDENCE must be a number")?;
        ensure!(
            (0.0..=1.0).contains(&confidence_threshold),
            "YOLO_CONFIDENCE must be within 0.0..=1.0"
        );
        let model = ModelConfig {
            path: get("YOLO_MODEL").unwrap_or_else(|| "yolo11n.onnx".to_string()),
            device: get("YOLO_DEVICE").unwrap_or_else(|| "cpu".to_string()),
            confidence_threshold,
        };

        let fps = get("FPS")
            .unwrap_or_else(|| "15".to_string())
            .parse::<u32>()
            .context("FPS must be an integer")?;
        ensure!(fps > 0, "FPS must be greater than zero");
        let video = VideoConfig {
            fps,
            show_preview: get("SHOW_PREVIEW").as_deref().map_or(false, truthy),
            pacing: parse_pacing(get("PACING").as_deref())?,
        };

        let defaults = EncoderSettings::default();
        let encoder = EncoderSettings {
            preset: get("ENCODER_PRESET").unwrap_or(defaults.preset),
            tune: get("ENCODER_TUNE").unwrap_or(defaults.tune),
            crf: match get("ENCODER_CRF") {
                Some(raw) => raw.parse().context("ENCODER_CRF must be an integer")?,
                None => defaults.crf,
            },
        };

        Ok(Config {
            source,
            stream,
            model,
            video,
            encoder,
        })
    }
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "True")
}

fn parse_pacing(value: Option<&str>) -> Result<PacingMode> {
    match value {
        None | Some("fixed") => Ok(PacingMode::Fixed),
        Some("deadline") => Ok(PacingMode::Deadline),
        Some(other) => anyhow::bail!("PACING must be `fixed` or `deadline`, got `{other}`"),
    }
}
