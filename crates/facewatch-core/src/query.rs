//! Recognition over the embedding index.

use crate::index::{EmbeddingIndex, IndexError};
use crate::types::Embedding;
use serde::Serialize;

/// Outcome of recognising one embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Recognition {
    /// The index holds no vectors at all.
    NoEnrolledFaces,
    Match { identifier: String, distance: f32 },
    /// Something was enrolled, but the closest vector is too far away.
    Unknown { nearest: String, distance: f32 },
}

impl Recognition {
    pub fn is_match(&self) -> bool {
        matches!(self, Recognition::Match { .. })
    }

    pub fn identifier(&self) -> Option<&str> {
        match self {
            Recognition::Match { identifier, .. } => Some(identifier),
            _ => None,
        }
    }
}

/// Classify `embedding` against the index.
///
/// A match requires `distance < threshold`. Lower distance means higher
/// confidence, so the threshold bounds distance from above.
pub fn recognize(
    index: &EmbeddingIndex,
    embedding: &Embedding,
    threshold: f32,
) -> Result<Recognition, IndexError> {
    let Some(best) = index.nearest(embedding)? else {
        return Ok(Recognition::NoEnrolledFaces);
    };

    tracing::debug!(
        identifier = %best.identifier,
        similarity = best.similarity(),
        distance = best.distance,
        threshold,
        "nearest enrolled face"
    );

    Ok(if best.distance < threshold {
        Recognition::Match {
            identifier: best.identifier,
            distance: best.distance,
        }
    } else {
        Recognition::Unknown {
            nearest: best.identifier,
            distance: best.distance,
        }
    })
}
