//! Face embedding extraction seam and its ONNX implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// The face chosen from an image together with its embedding.
#[derive(Debug, Clone)]
pub struct Face {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
}

/// Produces one embedding per image.
///
/// Returns `Ok(None)` when no face is found. When several faces are present
/// only the first (highest-confidence) one is used.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Face>, ExtractorError>;
}

impl<T: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<T> {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Face>, ExtractorError> {
        (**self).extract(image)
    }
}

/// SCRFD + ArcFace pipeline running on ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd)?;
        tracing::info!(path = %scrfd.display(), "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(&arcface)?;
        tracing::info!(path = %arcface.display(), "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Face>, ExtractorError> {
        let rgb = image.to_rgb8();
        let faces = self.detector.detect(&rgb)?;
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "multiple faces; using the most confident");
        }
        let Some(bbox) = faces.into_iter().next() else {
            return Ok(None);
        };

        let embedding = self.recognizer.extract(&rgb, &bbox)?;
        Ok(Some(Face { embedding, bbox }))
    }
}
