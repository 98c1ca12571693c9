//! Read-only view of the stores for the metadata commands.
//!
//! Nothing here loads the ONNX models or rebuilds the index, so `list`,
//! `show` and `status` work without model files.

use facewatch_core::cache::{CacheError, ProcessedPathCache};
use facewatch_core::index::{EmbeddingIndex, IndexError, LoadOutcome};
use facewatch_core::store::StoreError;
use facewatch_core::{DataLayout, MetadataStore, Profile, EMBEDDING_DIM};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("metadata store: {0}")]
    Store(#[from] StoreError),
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("processed-path cache: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub source_dir: PathBuf,
    pub data_dir: PathBuf,
    pub identifiers: usize,
    pub embeddings: usize,
    pub cached_paths: usize,
    /// `loaded`, `missing` or `inconsistent`; the latter two are rebuilt on
    /// the next `enroll` or `watch`.
    pub index: &'static str,
}

pub struct Inspector {
    source_dir: PathBuf,
    layout: DataLayout,
    store: MetadataStore,
}

impl Inspector {
    pub fn open(source_dir: PathBuf, layout: DataLayout) -> Result<Self, InspectError> {
        let store = MetadataStore::open(&layout.db_path())?;
        Ok(Self {
            source_dir,
            layout,
            store,
        })
    }

    pub fn list(&self) -> Result<Vec<String>, InspectError> {
        Ok(self.store.list_identifiers()?)
    }

    pub fn profile(&self, identifier: &str) -> Result<Option<Profile>, InspectError> {
        Ok(self.store.get_profile(identifier)?)
    }

    pub fn status(&self) -> Result<Status, InspectError> {
        let (index, outcome) = EmbeddingIndex::load(self.layout.index_paths(), EMBEDDING_DIM)?;
        let index_state = match outcome {
            LoadOutcome::Loaded => "loaded",
            LoadOutcome::Missing => "missing",
            LoadOutcome::Inconsistent(reason) => {
                tracing::warn!(%reason, "persisted index is inconsistent");
                "inconsistent"
            }
        };
        let cache = ProcessedPathCache::load(self.layout.cache_path())?;

        Ok(Status {
            version: env!("CARGO_PKG_VERSION"),
            source_dir: self.source_dir.clone(),
            data_dir: self.layout.data_dir.clone(),
            identifiers: self.store.list_identifiers()?.len(),
            embeddings: index.len(),
            cached_paths: cache.len(),
            index: index_state,
        })
    }
}
