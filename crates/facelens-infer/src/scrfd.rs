//! SCRFD face detector.
//!
//! Three-stride anchor-free decoding over a letterboxed 640×640 input,
//! followed by non-maximum suppression.

use crate::preprocess::to_tensor;
use crate::InferError;
use facelens_core::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use ort::session::Session;
use ort::value::TensorRef;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Output tensor positions for one stride: (scores, boxes, keypoints).
type LevelOutputs = (usize, usize, usize);

/// Maps letterboxed model coordinates back to the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

pub struct ScrfdDetector {
    session: Session,
    levels: [LevelOutputs; 3],
}

impl ScrfdDetector {
    pub fn from_bytes(model: &[u8]) -> Result<Self, InferError> {
        let session = Session::builder()?.with_intra_threads(2)?.commit_from_memory(model)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(InferError::Model {
                model: "scrfd",
                reason: format!("expected 9 outputs (3 strides × score/bbox/kps), got {}", names.len()),
            });
        }
        let levels = output_layout(&names);
        tracing::info!(outputs = ?names, ?levels, "loaded SCRFD detector");

        Ok(Self { session, levels })
    }

    /// Faces with confidence above `min_confidence`, best first, in frame coordinates.
    pub fn detect(&mut self, img: &GrayImage, min_confidence: f32) -> Result<Vec<BoundingBox>, InferError> {
        let (canvas, letterbox) = letterbox(img);
        let input = to_tensor(&canvas, MEAN, STD, 3);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_at, bbox_at, kps_at)) in STRIDES.iter().zip(self.levels.iter()) {
            let (_, scores) = outputs[score_at].try_extract_tensor::<f32>()?;
            let (_, boxes) = outputs[bbox_at].try_extract_tensor::<f32>()?;
            let (_, kps) = outputs[kps_at].try_extract_tensor::<f32>()?;
            decode_level(scores, boxes, kps, stride, &letterbox, min_confidence, &mut candidates);
        }

        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

/// Resize into the 640×640 canvas, padding with the mean so padding normalises to zero.
fn letterbox(img: &GrayImage) -> (GrayImage, Letterbox) {
    let (w, h) = img.dimensions();
    let lb = Letterbox::fit(w, h);
    let new_w = ((w as f32 * lb.scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((h as f32 * lb.scale).round() as u32).clamp(1, INPUT_SIZE);

    let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let mut canvas = GrayImage::from_pixel(INPUT_SIZE, INPUT_SIZE, Luma([MEAN.round() as u8]));
    imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);
    (canvas, lb)
}

/// Locate score/bbox/kps tensors per stride, by name ("score_8", ...) when
/// the export names them, else by the standard positional order.
fn output_layout(names: &[String]) -> [LevelOutputs; 3] {
    let find = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let named: Option<Vec<LevelOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    min_confidence: f32,
    out: &mut Vec<BoundingBox>,
) {
    let grid_w = INPUT_SIZE as usize / stride;
    let s = stride as f32;

    for (idx, &score) in scores.iter().enumerate() {
        if score < min_confidence {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
}

fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let iw = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let ih = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = iw * ih;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
