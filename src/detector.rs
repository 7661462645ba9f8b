// src/detector.rs

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

use crate::types::{BoundingBox, Detection, Frame, ModelConfig};

const YOLO_INPUT_SIZE: usize = 640;
const NUM_CLASSES: usize = 80;
const IOU_THRESHOLD: f32 = 0.45;

/// COCO class names, indexed by model class id.
const COCO_CLASSES: [&str; NUM_CLASSES] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Object-detection capability. Any conforming model works; the controller
/// never times an implementation out and treats failures as non-fatal.
pub trait Detector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// YOLO (v8/v11 output layout) detector backed by ONNX Runtime. Built once at
/// startup and injected into the pipeline.
pub struct YoloDetector {
    session: Session,
    confidence_threshold: f32,
}

impl YoloDetector {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        info!("Loading detection model: {}", config.path);

        let mut builder = Session::builder()?;

        if let Some(device_id) = cuda_device_id(&config.device)? {
            info!("Enabling CUDA execution provider (device {device_id})");
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])?;
        }

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&config.path)
            .context("Failed to load model")?;

        info!(
            "✓ Detector initialised (device: {}, confidence: {:.2})",
            config.device, config.confidence_threshold
        );

        Ok(Self {
            session,
            confidence_threshold: config.confidence_threshold,
        })
    }

    fn run_model(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1_usize, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }
}

impl Detector for YoloDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, letterbox) =
            letterbox(&frame.data, frame.width as usize, frame.height as usize);

        let output = self.run_model(&input)?;

        let detections = parse_predictions(
            &output,
            &letterbox,
            self.confidence_threshold,
            frame.width,
            frame.height,
        );

        debug!("Frame {}: {} detections", frame.index, detections.len());
        Ok(detections)
    }
}

/// Parse the compute-device selector: `cpu` disables hardware providers,
/// `cuda` or `cuda:N` selects a CUDA device.
fn cuda_device_id(device: &str) -> Result<Option<i32>> {
    if device == "cpu" {
        return Ok(None);
    }
    if device == "cuda" {
        return Ok(Some(0));
    }
    if let Some(rest) = device.strip_prefix("cuda:") {
        let id = rest
            .parse::<i32>()
            .with_context(|| format!("invalid CUDA device id `{rest}`"))?;
        return Ok(Some(id));
    }
    bail!("unsupported compute device `{device}` (expected `cpu` or `cuda[:N]`)")
}

/// Scale/padding applied when fitting a frame into the square model input.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Letterbox the frame into 640x640 on a gray canvas, normalise to [0, 1],
/// and lay the result out CHW.
fn letterbox(src: &[u8], src_w: usize, src_h: usize) -> (Vec<f32>, Letterbox) {
    let target = YOLO_INPUT_SIZE;

    let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
    let scaled_w = (src_w as f32 * scale) as usize;
    let scaled_h = (src_h as f32 * scale) as usize;

    let pad_x = (target - scaled_w) as f32 / 2.0;
    let pad_y = (target - scaled_h) as f32 / 2.0;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    let mut canvas = vec![114u8; target * target * 3];
    for y in 0..scaled_h {
        for x in 0..scaled_w {
            let src_idx = (y * scaled_w + x) * 3;
            let dst_x = x + pad_x as usize;
            let dst_y = y + pad_y as usize;
            let dst_idx = (dst_y * target + dst_x) * 3;
            canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
        }
    }

    let mut input = vec![0.0f32; 3 * target * target];
    for c in 0..3 {
        for h in 0..target {
            for w in 0..target {
                let hwc_idx = (h * target + w) * 3 + c;
                let chw_idx = c * target * target + h * target + w;
                input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
            }
        }
    }

    (
        input,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    )
}

/// Bilinear image resize over interleaved 3-channel buffers.
fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

#[derive(Debug, Clone)]
struct RawDetection {
    bbox: [f32; 4],
    confidence: f32,
    class_id: usize,
}

/// Decode the `[1, 84, N]` output tensor: per prediction, the best class
/// score gates on the configured threshold, coordinates are mapped back
/// through the letterbox into frame space, NMS collapses overlaps, and the
/// survivors are clamped to frame bounds.
fn parse_predictions(
    output: &[f32],
    letterbox: &Letterbox,
    confidence_threshold: f32,
    frame_w: u32,
    frame_h: u32,
) -> Vec<Detection> {
    let attrs = 4 + NUM_CLASSES;
    let num_preds = output.len() / attrs;
    let mut raw = Vec::new();

    for i in 0..num_preds {
        let cx = output[i];
        let cy = output[num_preds + i];
        let w = output[num_preds * 2 + i];
        let h = output[num_preds * 3 + i];

        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for c in 0..NUM_CLASSES {
            let conf = output[num_preds * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }

        if max_conf < confidence_threshold {
            continue;
        }

        // Center format -> corner format, then reverse the letterbox.
        let x1 = (cx - w / 2.0 - letterbox.pad_x) / letterbox.scale;
        let y1 = (cy - h / 2.0 - letterbox.pad_y) / letterbox.scale;
        let x2 = (cx + w / 2.0 - letterbox.pad_x) / letterbox.scale;
        let y2 = (cy + h / 2.0 - letterbox.pad_y) / letterbox.scale;

        raw.push(RawDetection {
            bbox: [x1, y1, x2, y2],
            confidence: max_conf,
            class_id: best_class,
        });
    }

    nms(raw, IOU_THRESHOLD)
        .into_iter()
        .filter_map(|det| {
            let [x1, y1, x2, y2] = det.bbox;
            BoundingBox::from_corners(x1, y1, x2, y2)
                .clamp_to(frame_w, frame_h)
                .map(|bbox| Detection {
                    label: COCO_CLASSES
                        .get(det.class_id)
                        .copied()
                        .unwrap_or("unknown")
                        .to_string(),
                    confidence: det.confidence,
                    bbox,
                })
        })
        .collect()
}

fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());

    let mut keep = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| calculate_iou(&current.bbox, &det.bbox) < iou_threshold);
        keep.push(current);
    }
    keep
}

fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a `[1, 84, N]` output buffer holding the given predictions as
    /// (cx, cy, w, h, class_id, confidence) in model-input coordinates.
    fn synth_output(num_preds: usize, preds: &[(f32, f32, f32, f32, usize, f32)]) -> Vec<f32> {
        let mut output = vec![0.0f32; (4 + NUM_CLASSES) * num_preds];
        for (i, &(cx, cy, w, h, class_id, conf)) in preds.iter().enumerate() {
            output[i] = cx;
            output[num_preds + i] = cy;
            output[num_preds * 2 + i] = w;
            output[num_preds * 3 + i] = h;
            output[num_preds * (4 + class_id) + i] = conf;
        }
        output
    }

    fn identity_letterbox() -> Letterbox {
        Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        }
    }

    #[test]
    fn test_letterbox_geometry() {
        let src = vec![0u8; 1280 * 720 * 3];
        let (input, lb) = letterbox(&src, 1280, 720);
        assert_eq!(input.len(), 3 * 640 * 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert!((lb.pad_x - 0.0).abs() < 1e-6);
        assert!((lb.pad_y - 140.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_filters_by_confidence() {
        let output = synth_output(
            8,
            &[
                (100.0, 100.0, 40.0, 40.0, 0, 0.9),
                (300.0, 300.0, 40.0, 40.0, 2, 0.1),
            ],
        );
        let detections = parse_predictions(&output, &identity_letterbox(), 0.25, 640, 640);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "person");
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_parse_maps_back_to_frame_coordinates() {
        // Frame 1280x720 letterboxed at scale 0.5 with 140px vertical pad:
        // a box centred at (320, 320) in model space maps to (640, 360).
        let lb = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 140.0,
        };
        let output = synth_output(4, &[(320.0, 320.0, 100.0, 100.0, 2, 0.8)]);
        let detections = parse_predictions(&output, &lb, 0.25, 1280, 720);
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert_eq!((bbox.x1, bbox.y1, bbox.x2, bbox.y2), (540, 260, 740, 460));
        assert_eq!(detections[0].label, "car");
    }

    #[test]
    fn test_parse_clamps_out_of_frame_boxes() {
        let output = synth_output(4, &[(5.0, 5.0, 60.0, 60.0, 0, 0.9)]);
        let detections = parse_predictions(&output, &identity_letterbox(), 0.25, 640, 640);
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert!(bbox.x1 >= 0 && bbox.y1 >= 0);
        assert!(bbox.x1 < bbox.x2 && bbox.y1 < bbox.y2);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let raw = vec![
            RawDetection {
                bbox: [0.0, 0.0, 100.0, 100.0],
                confidence: 0.9,
                class_id: 0,
            },
            RawDetection {
                bbox: [5.0, 5.0, 105.0, 105.0],
                confidence: 0.8,
                class_id: 0,
            },
            RawDetection {
                bbox: [300.0, 300.0, 400.0, 400.0],
                confidence: 0.7,
                class_id: 2,
            },
        ];
        let kept = nms(raw, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_cuda_device_selector() {
        assert_eq!(cuda_device_id("cpu").unwrap(), None);
        assert_eq!(cuda_device_id("cuda").unwrap(), Some(0));
        assert_eq!(cuda_device_id("cuda:1").unwrap(), Some(1));
        assert!(cuda_device_id("cuda:x").is_err());
        assert!(cuda_device_id("tpu").is_err());
    }

    #[test]
    fn test_coco_table_is_complete() {
        assert_eq!(COCO_CLASSES.len(), NUM_CLASSES);
        assert_eq!(COCO_CLASSES[2], "car");
        assert_eq!(COCO_CLASSES[7], "truck");
    }
}
