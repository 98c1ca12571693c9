//! ArcFace face recognizer via ONNX Runtime.
//!
//! Produces 512-dimensional embeddings from aligned RGB face crops using the
//! w600k_r50 model. Embeddings are returned raw; the index normalises them.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding, EMBEDDING_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must supply them for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        Ok(Self { session })
    }

    /// Extract the embedding of `face` from `image`.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;

        let aligned = alignment::align_face(image, landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Normalise a 112×112 RGB crop into an NCHW tensor, channels in RGB order.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        if x >= ALIGNED_SIZE || y >= ALIGNED_SIZE {
            continue;
        }
        for (channel, &value) in pixel.0.iter().enumerate() {
            tensor[[0, channel, y as usize, x as usize]] = (value as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}
