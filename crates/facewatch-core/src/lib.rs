//! Folder-driven face enrollment and recognition.
//!
//! Keeps a flat cosine-similarity index of face embeddings and a SQLite
//! profile store in step with a directory of per-person photos. Embeddings
//! come from SCRFD detection plus ArcFace recognition, both run through
//! ONNX Runtime on the CPU.

pub mod alignment;
pub mod cache;
pub mod codec;
pub mod detector;
pub mod extractor;
pub mod index;
mod persist;
pub mod query;
pub mod recognizer;
pub mod reconcile;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::ProcessedPathCache;
pub use codec::{FsCodec, ImageCodec};
pub use extractor::{EmbeddingExtractor, Face, OnnxExtractor};
pub use index::{EmbeddingIndex, IndexPaths, Neighbor};
pub use query::{recognize, Recognition};
pub use reconcile::{DataLayout, EnrollReport, ReconcileError, Reconciler};
pub use store::MetadataStore;
pub use types::{BoundingBox, Embedding, Profile, EMBEDDING_DIM};

use std::path::{Path, PathBuf};

/// `$XDG_DATA_HOME/facewatch`, falling back to `~/.local/share/facewatch`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

/// Where the ONNX models are looked up when no directory is configured:
/// `models/` inside the data directory in use.
pub fn default_model_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("models")
}
