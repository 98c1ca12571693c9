//! Set of source image paths already consumed by reconciliation.

use crate::persist::{read_optional, write_atomic};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("processed-path cache {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialise processed-path cache: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Persisted as a sorted JSON array so identical contents give identical bytes.
#[derive(Debug)]
pub struct ProcessedPathCache {
    path: PathBuf,
    entries: BTreeSet<PathBuf>,
}

impl ProcessedPathCache {
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            entries: BTreeSet::new(),
        }
    }

    /// Load the cache at `path`; a missing file is an empty cache.
    ///
    /// A file that exists but does not parse is an error: treating it as
    /// empty would re-enroll every image and duplicate embeddings.
    pub fn load(path: PathBuf) -> Result<Self, CacheError> {
        let Some(bytes) = read_optional(&path)? else {
            tracing::debug!(path = %path.display(), "no processed-path cache yet");
            return Ok(Self::empty(path));
        };

        let entries: BTreeSet<PathBuf> =
            serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "processed-path cache loaded");
        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(&self.entries).map_err(CacheError::Serialize)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains(path)
    }

    /// Returns whether the path was newly added.
    pub fn insert(&mut self, path: PathBuf) -> bool {
        self.entries.insert(path)
    }

    /// Drop every entry whose parent folder name is not in `folders`.
    ///
    /// Entries too short to have a parent folder are kept. Returns the number
    /// of entries removed.
    pub fn retain_folders(&mut self, folders: &BTreeSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| match owning_folder(entry) {
            Some(folder) => folders.contains(folder),
            None => true,
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(PathBuf::as_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Second-to-last path segment: the person folder of `<root>/<person>/<file>`.
fn owning_folder(entry: &Path) -> Option<&str> {
    entry.parent()?.file_name()?.to_str()
}
