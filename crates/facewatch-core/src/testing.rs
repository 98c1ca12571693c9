//! Deterministic stand-ins for the model-backed collaborators.

use crate::extractor::{EmbeddingExtractor, ExtractorError, Face};
use crate::types::{BoundingBox, Embedding, EMBEDDING_DIM};
use image::{DynamicImage, Rgb, RgbImage};

/// Maps the colour of the top-left pixel to an embedding direction.
/// Pure black means "no face".
#[derive(Debug, Default)]
pub struct ColorExtractor {
    pub calls: usize,
}

impl EmbeddingExtractor for ColorExtractor {
    fn extract(&mut self, image: &DynamicImage) -> Result<Option<Face>, ExtractorError> {
        self.calls += 1;
        let rgb = image.to_rgb8();
        let Some(&Rgb(color)) = rgb.get_pixel_checked(0, 0) else {
            return Ok(None);
        };
        if color == [0, 0, 0] {
            return Ok(None);
        }
        Ok(Some(Face {
            embedding: color_embedding(color),
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: rgb.width() as f32,
                height: rgb.height() as f32,
                confidence: 1.0,
                landmarks: None,
            },
        }))
    }
}

pub fn color_embedding(color: [u8; 3]) -> Embedding {
    let mut values = vec![0.0f32; EMBEDDING_DIM];
    for (slot, channel) in values.iter_mut().zip(color) {
        *slot = channel as f32;
    }
    Embedding::new(values)
}

pub fn solid_image(color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb(color))
}
