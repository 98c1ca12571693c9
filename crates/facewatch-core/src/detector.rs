//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the square model input, decodes the
//! anchor-free box and landmark regressions of the three stride levels, and
//! suppresses overlapping candidates.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the resized image inside the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let fitted_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let fitted_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - fitted_w) / 2,
            pad_y: (target - fitted_h) / 2,
            width: fitted_w,
            height: fitted_h,
        }
    }

    /// Map a point in model-input space back onto the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Where each stride level's tensors sit in the session outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
    levels: [LevelOutputs; 3],
}

impl OutputLayout {
    /// Resolve tensors named `score_8`, `bbox_16`, `kps_32`, ... when every
    /// name is present; otherwise assume the stock export order of
    /// scores, then boxes, then landmarks, each for strides 8/16/32.
    fn from_names(names: &[String]) -> Self {
        let position = |kind: &str, stride: usize| {
            let wanted = format!("{kind}_{stride}");
            names.iter().position(|n| *n == wanted)
        };

        let mut levels = [LevelOutputs { score: 0, bbox: 0, kps: 0 }; 3];
        let mut named = true;
        for (level, &stride) in levels.iter_mut().zip(SCRFD_STRIDES.iter()) {
            match (
                position("score", stride),
                position("bbox", stride),
                position("kps", stride),
            ) {
                (Some(score), Some(bbox), Some(kps)) => *level = LevelOutputs { score, bbox, kps },
                _ => {
                    named = false;
                    break;
                }
            }
        }

        if named {
            tracing::debug!("SCRFD: name-based output mapping");
            return Self { levels };
        }

        tracing::debug!(?names, "SCRFD: unrecognised output names, using positional mapping");
        Self {
            levels: std::array::from_fn(|i| LevelOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            }),
        }
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    layout: OutputLayout,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }

        let layout = OutputLayout::from_names(&names);
        tracing::debug!(path = %model_path.display(), ?layout, "SCRFD outputs resolved");

        Ok(Self { session, layout })
    }

    /// Detect faces, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in self.layout.levels.iter().zip(SCRFD_STRIDES.iter()) {
            let (_, scores) = outputs[level.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[level.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[level.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            candidates.extend(decode_level(
                scores,
                boxes,
                kps,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let faces = non_max_suppression(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(faces = faces.len(), "SCRFD detection finished");
        Ok(faces)
    }
}

/// Resize into the letterbox and normalise to an NCHW RGB tensor.
///
/// Padding stays at 0.0, which is the normalised value of the channel mean.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
    let resized = image::imageops::resize(
        image,
        letterbox.width,
        letterbox.height,
        FilterType::Triangle,
    );

    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        for (channel, &value) in pixel.0.iter().enumerate() {
            tensor[[0, channel, ty, tx]] = (value as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Decode the candidates of one stride level above `threshold`.
///
/// Each grid cell carries two anchors; box regressions are distances from the
/// anchor centre to the four edges, landmark regressions are offsets, both in
/// units of the stride.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let edges = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(cx - edges[0] * step, cy - edges[1] * step);
            let (x2, y2) = letterbox.unmap(cx + edges[2] * step, cy + edges[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|offsets| {
                std::array::from_fn(|i| {
                    letterbox.unmap(cx + offsets[i * 2] * step, cy + offsets[i * 2 + 1] * step)
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS: keep the most confident box, drop anything overlapping a kept box.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
