//! Flat inner-product index over unit-normalised face embeddings.
//!
//! Each slot pairs one vector with the identifier it belongs to, so the vector
//! count and the identifier count cannot drift apart in memory. On disk the
//! slots are written as two companion artifacts, a binary vector file and a
//! JSON identifier list, which are always loaded and saved together.
//!
//! Search is exhaustive: cosine similarity is the dot product of unit
//! vectors and the reported distance is `1 - similarity`.

use crate::codec::ImageCodec;
use crate::extractor::EmbeddingExtractor;
use crate::persist::{read_optional, write_atomic};
use crate::store::{MetadataStore, StoreError};
use crate::types::Embedding;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const VECTOR_MAGIC: &[u8; 4] = b"FWIX";
const VECTOR_FORMAT_VERSION: u32 = 1;
/// magic + version + dimension + count
const VECTOR_HEADER_LEN: usize = 4 + 4 + 4 + 8;

pub const VECTOR_FILE: &str = "face_index.bin";
pub const IDENTIFIER_FILE: &str = "face_ids.json";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index is read-only: a previous persist failed and the on-disk pair may disagree")]
    Poisoned,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("identifier list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata store: {0}")]
    Store(#[from] StoreError),
}

/// Locations of the two companion artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPaths {
    pub vectors: PathBuf,
    pub identifiers: PathBuf,
}

impl IndexPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors: dir.join(VECTOR_FILE),
            identifiers: dir.join(IDENTIFIER_FILE),
        }
    }
}

/// What [`EmbeddingIndex::load`] found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// Neither artifact exists.
    Missing,
    /// Only one artifact exists, or the pair does not agree.
    Inconsistent(String),
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub identifier: String,
    /// `1 - cosine_similarity`, in [0, 2].
    pub distance: f32,
    pub slot: usize,
}

impl Neighbor {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

#[derive(Debug, Clone)]
struct Slot {
    identifier: String,
    vector: Vec<f32>,
}

pub struct EmbeddingIndex {
    dim: usize,
    slots: Vec<Slot>,
    paths: IndexPaths,
    poisoned: bool,
}

impl EmbeddingIndex {
    /// Empty index that will persist to `paths`. Nothing is written yet.
    pub fn new(paths: IndexPaths, dim: usize) -> Self {
        Self {
            dim,
            slots: Vec::new(),
            paths,
            poisoned: false,
        }
    }

    /// Read the artifact pair.
    ///
    /// Anything short of a complete, agreeing pair yields an empty index plus
    /// the reason; only unexpected I/O errors are returned as `Err`.
    pub fn load(paths: IndexPaths, dim: usize) -> Result<(Self, LoadOutcome), IndexError> {
        let vectors = read_optional(&paths.vectors)?;
        let identifiers = read_optional(&paths.identifiers)?;
        let mut index = Self::new(paths, dim);

        let (vectors, identifiers) = match (vectors, identifiers) {
            (Some(v), Some(i)) => (v, i),
            (None, None) => return Ok((index, LoadOutcome::Missing)),
            (Some(_), None) => {
                return Ok((index, inconsistent("identifier list missing")));
            }
            (None, Some(_)) => {
                return Ok((index, inconsistent("vector file missing")));
            }
        };

        let vectors = match decode_vectors(&vectors, dim) {
            Ok(v) => v,
            Err(reason) => return Ok((index, inconsistent(reason))),
        };
        let identifiers: Vec<String> = match serde_json::from_slice(&identifiers) {
            Ok(ids) => ids,
            Err(e) => return Ok((index, inconsistent(format!("identifier list: {e}")))),
        };
        if vectors.len() != identifiers.len() {
            let reason = format!(
                "{} vectors but {} identifiers",
                vectors.len(),
                identifiers.len()
            );
            return Ok((index, inconsistent(reason)));
        }

        index.slots = identifiers
            .into_iter()
            .zip(vectors)
            .map(|(identifier, vector)| Slot { identifier, vector })
            .collect();
        tracing::info!(
            vectors = index.slots.len(),
            path = %index.paths.vectors.display(),
            "embedding index loaded"
        );
        Ok((index, LoadOutcome::Loaded))
    }

    /// Load the pair, regenerating it from the metadata store when it is
    /// missing, inconsistent or empty.
    pub fn load_or_rebuild<E, C>(
        paths: IndexPaths,
        dim: usize,
        store: &MetadataStore,
        extractor: &mut E,
        codec: &C,
    ) -> Result<Self, IndexError>
    where
        E: EmbeddingExtractor + ?Sized,
        C: ImageCodec + ?Sized,
    {
        let (mut index, outcome) = Self::load(paths, dim)?;
        match outcome {
            LoadOutcome::Loaded if !index.is_empty() => return Ok(index),
            LoadOutcome::Loaded => tracing::info!("persisted index is empty"),
            LoadOutcome::Missing => tracing::info!("no persisted index"),
            LoadOutcome::Inconsistent(reason) => {
                tracing::warn!(%reason, "persisted index is inconsistent; discarding it")
            }
        }
        index.rebuild_from_store(store, extractor, codec)?;
        Ok(index)
    }

    /// Regenerate the index from every profile's representative image.
    ///
    /// Recovers at most one embedding per identifier. Images that are gone,
    /// unreadable or faceless are logged and skipped. Returns the number of
    /// vectors inserted.
    pub fn rebuild_from_store<E, C>(
        &mut self,
        store: &MetadataStore,
        extractor: &mut E,
        codec: &C,
    ) -> Result<usize, IndexError>
    where
        E: EmbeddingExtractor + ?Sized,
        C: ImageCodec + ?Sized,
    {
        tracing::info!("rebuilding embedding index from representative images");
        let mut slots = Vec::new();

        for profile in store.list_profiles()? {
            let Some(image_path) = profile.representative_image else {
                tracing::debug!(identifier = %profile.identifier, "no representative image");
                continue;
            };
            let image = match codec.decode(&image_path) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(identifier = %profile.identifier, error = %e, "skipping unreadable representative image");
                    continue;
                }
            };
            let face = match extractor.extract(&image) {
                Ok(Some(face)) => face,
                Ok(None) => {
                    tracing::warn!(identifier = %profile.identifier, path = %image_path.display(), "no face in representative image");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(identifier = %profile.identifier, error = %e, "extraction failed for representative image");
                    continue;
                }
            };
            self.check_dim(face.embedding.dim())?;
            if profile.embedding_count > 1 {
                tracing::debug!(
                    identifier = %profile.identifier,
                    recorded = profile.embedding_count,
                    "recovering a single embedding"
                );
            }

            slots.push(Slot {
                vector: normalized(&face.embedding.values, &profile.identifier),
                identifier: profile.identifier,
            });
        }

        let rebuilt = slots.len();
        self.slots = slots;
        self.poisoned = false;
        self.persist()?;
        tracing::info!(vectors = rebuilt, "embedding index rebuilt");
        Ok(rebuilt)
    }

    /// Append one embedding for `identifier` and persist the pair.
    pub fn insert(&mut self, embedding: &Embedding, identifier: &str) -> Result<(), IndexError> {
        self.check_writable()?;
        self.check_dim(embedding.dim())?;

        self.slots.push(Slot {
            identifier: identifier.to_string(),
            vector: normalized(&embedding.values, identifier),
        });
        self.persist()?;
        tracing::debug!(identifier, vectors = self.slots.len(), "embedding inserted");
        Ok(())
    }

    /// Closest stored vector, or `None` when the index is empty.
    pub fn nearest(&self, query: &Embedding) -> Result<Option<Neighbor>, IndexError> {
        if self.slots.is_empty() {
            tracing::debug!("search on empty index");
            return Ok(None);
        }
        Ok(self.search(query, 1)?.into_iter().next())
    }

    /// Up to `k` nearest vectors by ascending distance.
    ///
    /// Equal distances are ordered by identifier, then by slot.
    pub fn search(&self, query: &Embedding, k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_dim(query.dim())?;
        if k == 0 || self.slots.is_empty() {
            return Ok(Vec::new());
        }

        let query = normalized(&query.values, "<query>");
        let mut scored: Vec<(usize, f32)> = self
            .slots
            .iter()
            .enumerate()
            .map(|(slot, s)| (slot, 1.0 - dot(&query, &s.vector)))
            .collect();

        scored.sort_by(|&(slot_a, dist_a), &(slot_b, dist_b)| {
            dist_a
                .partial_cmp(&dist_b)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.slots[slot_a].identifier.cmp(&self.slots[slot_b].identifier))
                .then(slot_a.cmp(&slot_b))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(slot, distance)| Neighbor {
                identifier: self.slots[slot].identifier.clone(),
                distance,
                slot,
            })
            .collect())
    }

    /// Remove every vector stored for `identifier` by rebuilding the slot
    /// table from the survivors. Returns how many vectors were removed.
    pub fn delete_all(&mut self, identifier: &str) -> Result<usize, IndexError> {
        self.check_writable()?;
        if !self.slots.iter().any(|s| s.identifier == identifier) {
            return Ok(0);
        }

        let before = self.slots.len();
        let survivors: Vec<Slot> = self
            .slots
            .iter()
            .filter(|s| s.identifier != identifier)
            .map(|s| Slot {
                identifier: s.identifier.clone(),
                vector: unit(&s.vector).unwrap_or_else(|| s.vector.clone()),
            })
            .collect();
        let removed = before - survivors.len();

        self.slots = survivors;
        self.persist()?;
        tracing::info!(identifier, removed, remaining = self.slots.len(), "embeddings deleted");
        Ok(removed)
    }

    /// Write both artifacts, vectors first.
    ///
    /// On failure the index stops accepting writes, since the vector file may
    /// already have been replaced while the identifier list was not.
    pub fn persist(&mut self) -> Result<(), IndexError> {
        let result = self.write_artifacts();
        if let Err(e) = &result {
            self.poisoned = true;
            tracing::error!(error = %e, "failed to persist embedding index; refusing further writes");
        }
        result
    }

    fn write_artifacts(&self) -> Result<(), IndexError> {
        write_atomic(&self.paths.vectors, &encode_vectors(self.dim, &self.slots))?;
        let identifiers: Vec<&str> = self.slots.iter().map(|s| s.identifier.as_str()).collect();
        write_atomic(&self.paths.identifiers, &serde_json::to_vec(&identifiers)?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    /// Number of vectors stored for `identifier`.
    pub fn count_for(&self, identifier: &str) -> usize {
        self.slots.iter().filter(|s| s.identifier == identifier).count()
    }

    /// Distinct identifiers with at least one vector.
    pub fn identifiers(&self) -> BTreeSet<String> {
        self.slots.iter().map(|s| s.identifier.clone()).collect()
    }

    fn check_writable(&self) -> Result<(), IndexError> {
        if self.poisoned {
            return Err(IndexError::Poisoned);
        }
        Ok(())
    }

    fn check_dim(&self, actual: usize) -> Result<(), IndexError> {
        if actual != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual,
            });
        }
        Ok(())
    }
}

fn inconsistent(reason: impl Into<String>) -> LoadOutcome {
    LoadOutcome::Inconsistent(reason.into())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Unit-length copy, `None` for a zero vector.
fn unit(values: &[f32]) -> Option<Vec<f32>> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        Some(values.iter().map(|v| v / norm).collect())
    } else {
        None
    }
}

/// Unit-length copy; a zero vector is kept raw and reported, since it means
/// the extractor produced a malformed embedding.
fn normalized(values: &[f32], owner: &str) -> Vec<f32> {
    unit(values).unwrap_or_else(|| {
        tracing::warn!(identifier = owner, "embedding has zero norm; using it unnormalised");
        values.to_vec()
    })
}

fn encode_vectors(dim: usize, slots: &[Slot]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VECTOR_HEADER_LEN + slots.len() * dim * 4);
    buf.extend_from_slice(VECTOR_MAGIC);
    buf.extend_from_slice(&VECTOR_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(dim as u32).to_le_bytes());
    buf.extend_from_slice(&(slots.len() as u64).to_le_bytes());
    for slot in slots {
        for value in &slot.vector {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
    buf
}

fn decode_vectors(bytes: &[u8], dim: usize) -> Result<Vec<Vec<f32>>, String> {
    if bytes.len() < VECTOR_HEADER_LEN {
        return Err(format!("vector file truncated ({} bytes)", bytes.len()));
    }
    let (header, body) = bytes.split_at(VECTOR_HEADER_LEN);
    if &header[0..4] != VECTOR_MAGIC {
        return Err("vector file has wrong magic".into());
    }

    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let version = u32_at(4);
    if version != VECTOR_FORMAT_VERSION {
        return Err(format!("unsupported vector format version {version}"));
    }
    let stored_dim = u32_at(8) as usize;
    if stored_dim != dim {
        return Err(format!("vector dimension {stored_dim}, expected {dim}"));
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header[12..20]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    let expected = count.checked_mul(dim).and_then(|n| n.checked_mul(4));
    if expected != Some(body.len()) {
        return Err(format!(
            "vector file holds {} payload bytes, header claims {count} vectors",
            body.len()
        ));
    }
    if dim == 0 {
        return Ok(vec![Vec::new(); count]);
    }

    Ok(body
        .chunks_exact(dim * 4)
        .map(|row| {
            row.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect())
}
