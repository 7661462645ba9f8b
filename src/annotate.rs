// src/annotate.rs

use anyhow::{ensure, Result};
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

use crate::metrics::MetricsSnapshot;
use crate::types::{BoundingBox, Detection, Frame};

const FONT: i32 = imgproc::FONT_HERSHEY_SIMPLEX;
const CAPTION_SCALE: f64 = 0.5;
const CAPTION_PAD: i32 = 6;

fn box_color() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

fn text_color() -> Scalar {
    Scalar::new(0.0, 0.0, 0.0, 0.0)
}

/// Draw detections and the host-utilization line onto a copy of `frame`.
/// Pure: the input buffer is never touched, the output is always a new
/// buffer. Detections are drawn in the order given; boxes are clamped to
/// frame bounds before any drawing call sees them.
pub fn annotate(
    frame: &Frame,
    detections: &[Detection],
    metrics: &MetricsSnapshot,
) -> Result<Frame> {
    ensure!(
        frame.data.len() == frame.byte_len(),
        "frame buffer is {} bytes, expected {} for {}x{}",
        frame.data.len(),
        frame.byte_len(),
        frame.width,
        frame.height
    );

    let mat = Mat::from_slice(&frame.data)?;
    let mat = mat.reshape(3, frame.height as i32)?;
    let mut output = mat.try_clone()?;

    for detection in detections {
        if let Some(bbox) = detection.bbox.clamp_to(frame.width, frame.height) {
            draw_detection(&mut output, detection, &bbox, frame.width, frame.height)?;
        }
    }

    draw_system_usage(&mut output, metrics)?;

    let data = output.data_bytes()?.to_vec();
    Ok(Frame {
        data,
        width: frame.width,
        height: frame.height,
        index: frame.index,
    })
}

fn draw_detection(
    output: &mut Mat,
    detection: &Detection,
    bbox: &BoundingBox,
    frame_width: u32,
    frame_height: u32,
) -> Result<()> {
    imgproc::rectangle(
        output,
        Rect::new(bbox.x1, bbox.y1, bbox.width(), bbox.height()),
        box_color(),
        2,
        imgproc::LINE_8,
        0,
    )?;

    let caption = format!("{} {:.2}", detection.label, detection.confidence);
    let mut baseline = 0;
    let text = imgproc::get_text_size(&caption, FONT, CAPTION_SCALE, 1, &mut baseline)?;

    // Caption background above the top-left corner, shifted below it when
    // there is no room, and clipped at the frame edges.
    let label_h = text.height + CAPTION_PAD;
    let label_top = if bbox.y1 - label_h < 0 {
        bbox.y1
    } else {
        bbox.y1 - label_h
    };
    let label_h = label_h.min(frame_height as i32 - label_top);
    let label_w = text.width.min(frame_width as i32 - bbox.x1);
    if label_w <= 0 || label_h <= 0 {
        return Ok(());
    }

    imgproc::rectangle(
        output,
        Rect::new(bbox.x1, label_top, label_w, label_h),
        box_color(),
        -1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::put_text(
        output,
        &caption,
        Point::new(bbox.x1, label_top + text.height + 2),
        FONT,
        CAPTION_SCALE,
        text_color(),
        1,
        imgproc::LINE_8,
        false,
    )?;

    Ok(())
}

fn draw_system_usage(output: &mut Mat, metrics: &MetricsSnapshot) -> Result<()> {
    let line = format!(
        "CPU: {:.1}%  MEM: {:.1}%",
        metrics.cpu_percent, metrics.mem_percent
    );
    imgproc::put_text(
        output,
        &line,
        Point::new(10, 30),
        FONT,
        1.0,
        box_color(),
        2,
        imgproc::LINE_AA,
        false,
    )?;
    Ok(())
}
