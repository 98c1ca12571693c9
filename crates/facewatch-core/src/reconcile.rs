//! Keeps the index and profile store in step with a folder tree of
//! per-person images.
//!
//! Layout: `<source_root>/<identifier>/<image>`. Each [`Reconciler::enroll_once`]
//! first removes identifiers whose folder has disappeared, then enrolls every
//! image not yet recorded in the processed-path cache. Removal always runs
//! first so a renamed folder becomes a clean delete followed by a fresh
//! enrollment.
//!
//! Per-file failures (undecodable image, no face, extractor error) are logged
//! and skipped without touching the cache, so those files are retried on the
//! next run.

use crate::cache::{CacheError, ProcessedPathCache};
use crate::codec::{CodecError, ImageCodec};
use crate::extractor::{EmbeddingExtractor, ExtractorError, Face};
use crate::index::{EmbeddingIndex, IndexError, IndexPaths, Neighbor};
use crate::query::{self, Recognition};
use crate::store::{MetadataStore, StoreError};
use crate::types::{Embedding, Profile, EMBEDDING_DIM};
use image::DynamicImage;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions accepted as source images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub const DB_FILE: &str = "faces.db";
pub const CACHE_FILE: &str = "enrolled_paths.json";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("metadata store: {0}")]
    Store(#[from] StoreError),
    #[error("processed-path cache: {0}")]
    Cache(#[from] CacheError),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the durable artifacts live inside one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub data_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn index_paths(&self) -> IndexPaths {
        IndexPaths::in_dir(&self.data_dir)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }

    /// Saved reference photo for `identifier`.
    pub fn representative_path(&self, identifier: &str) -> PathBuf {
        self.data_dir.join(format!("{identifier}_display.png"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The file could not be decoded as an image.
    Unreadable,
    NoFace,
    /// The extractor failed while processing the image.
    ExtractionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// What one reconciliation run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollReport {
    /// Identifiers deleted because their folder is gone.
    pub removed: Vec<String>,
    pub embeddings_removed: usize,
    /// Identifiers that received their first profile in this run.
    pub new_identifiers: Vec<String>,
    pub embeddings_added: usize,
    pub skipped: Vec<SkippedFile>,
    pub cache_purged: usize,
    pub cache_saved: bool,
}

impl EnrollReport {
    pub fn changed(&self) -> bool {
        !self.removed.is_empty() || self.cache_purged > 0 || self.embeddings_added > 0
    }
}

/// Owns the stores and collaborators and drives them to match the source tree.
pub struct Reconciler<E, C> {
    source_root: PathBuf,
    layout: DataLayout,
    index: EmbeddingIndex,
    store: MetadataStore,
    cache: ProcessedPathCache,
    extractor: E,
    codec: C,
}

impl<E, C> Reconciler<E, C>
where
    E: EmbeddingExtractor,
    C: ImageCodec,
{
    /// Open every durable store under `layout`, rebuilding the index from
    /// representative images if it is missing or empty.
    pub fn open(
        source_root: PathBuf,
        layout: DataLayout,
        mut extractor: E,
        codec: C,
    ) -> Result<Self, ReconcileError> {
        let store = MetadataStore::open(&layout.db_path())?;
        let index = EmbeddingIndex::load_or_rebuild(
            layout.index_paths(),
            EMBEDDING_DIM,
            &store,
            &mut extractor,
            &codec,
        )?;
        let cache = ProcessedPathCache::load(layout.cache_path())?;

        tracing::info!(
            source = %source_root.display(),
            data = %layout.data_dir.display(),
            vectors = index.len(),
            cached_paths = cache.len(),
            "stores opened"
        );
        Ok(Self::new(source_root, layout, index, store, cache, extractor, codec))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_root: PathBuf,
        layout: DataLayout,
        index: EmbeddingIndex,
        store: MetadataStore,
        cache: ProcessedPathCache,
        extractor: E,
        codec: C,
    ) -> Self {
        Self {
            source_root,
            layout,
            index,
            store,
            cache,
            extractor,
            codec,
        }
    }

    /// One reconciliation pass: removals, then additions, then a cache save
    /// if anything changed.
    ///
    /// Index and profile writes land per file, so when a pass fails partway
    /// the cache is still saved with the files already enrolled before the
    /// error is returned.
    pub fn enroll_once(&mut self) -> Result<EnrollReport, ReconcileError> {
        tracing::info!(source = %self.source_root.display(), "reconciliation started");
        let mut report = EnrollReport::default();

        let passes = self
            .remove_deleted(&mut report)
            .and_then(|current| self.enroll_new(&current, &mut report));

        if let Err(e) = passes {
            if report.changed() {
                match self.cache.save() {
                    Ok(()) => tracing::info!(
                        added = report.embeddings_added,
                        "reconciliation aborted; progress so far recorded in cache"
                    ),
                    Err(save_err) => tracing::error!(
                        error = %save_err,
                        "reconciliation aborted and the cache could not be saved"
                    ),
                }
            }
            return Err(e);
        }

        if report.changed() {
            self.cache.save()?;
            report.cache_saved = true;
        } else {
            tracing::debug!("no changes; processed-path cache left untouched");
        }

        tracing::info!(
            removed = report.removed.len(),
            added = report.embeddings_added,
            skipped = report.skipped.len(),
            vectors = self.index.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Drop identifiers with no folder, then purge their cache entries.
    /// Returns the folder names currently present.
    fn remove_deleted(&mut self, report: &mut EnrollReport) -> Result<BTreeSet<String>, ReconcileError> {
        let current = self.current_folders()?;

        let mut enrolled: BTreeSet<String> = self.store.list_identifiers()?.into_iter().collect();
        enrolled.extend(self.index.identifiers());

        for identifier in enrolled.difference(&current) {
            report.embeddings_removed += self.remove_identifier(identifier)?;
            report.removed.push(identifier.clone());
        }
        if !report.removed.is_empty() {
            tracing::info!(identifiers = ?report.removed, "removed identifiers whose folder is gone");
        }

        report.cache_purged = self.cache.retain_folders(&current);
        if report.cache_purged > 0 {
            tracing::info!(purged = report.cache_purged, remaining = self.cache.len(), "purged cache entries");
        }
        Ok(current)
    }

    fn remove_identifier(&mut self, identifier: &str) -> Result<usize, ReconcileError> {
        if let Some(image) = self.store.get_representative_image(identifier)? {
            match fs::remove_file(&image) {
                Ok(()) => tracing::debug!(identifier, path = %image.display(), "representative image deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(identifier, path = %image.display(), "representative image already gone")
                }
                Err(e) => tracing::warn!(
                    identifier,
                    path = %image.display(),
                    error = %e,
                    "could not delete representative image"
                ),
            }
        }

        self.store.delete_profile(identifier)?;
        Ok(self.index.delete_all(identifier)?)
    }

    fn enroll_new(&mut self, current: &BTreeSet<String>, report: &mut EnrollReport) -> Result<(), ReconcileError> {
        for person in current {
            let folder = self.source_root.join(person);
            let images = match folder_images(&folder) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(path = %folder.display(), error = %e, "cannot list person folder; skipping");
                    continue;
                }
            };

            let before = report.embeddings_added;
            for path in images {
                if self.cache.contains(&path) {
                    continue;
                }
                self.enroll_file(person, path, report)?;
            }

            let added = report.embeddings_added - before;
            if added > 0 {
                tracing::info!(identifier = %person, added, "embeddings added");
            }
        }
        Ok(())
    }

    fn enroll_file(&mut self, person: &str, path: PathBuf, report: &mut EnrollReport) -> Result<(), ReconcileError> {
        let image = match self.codec.decode(&path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read image; will retry next run");
                report.skipped.push(SkippedFile { path, reason: SkipReason::Unreadable });
                return Ok(());
            }
        };

        let face = match self.extractor.extract(&image) {
            Ok(Some(face)) => face,
            Ok(None) => {
                tracing::warn!(path = %path.display(), "no face detected; will retry next run");
                report.skipped.push(SkippedFile { path, reason: SkipReason::NoFace });
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "extraction failed; will retry next run");
                report.skipped.push(SkippedFile { path, reason: SkipReason::ExtractionFailed });
                return Ok(());
            }
        };

        self.index.insert(&face.embedding, person)?;

        let existing = self.store.get_profile(person)?;
        let has_image = existing
            .as_ref()
            .is_some_and(|p| p.representative_image.is_some());
        let saved = if has_image {
            None
        } else {
            self.save_representative(person, &image)
        };
        self.store.upsert_profile(person, saved.as_deref(), true)?;

        if existing.is_none() {
            report.new_identifiers.push(person.to_string());
        }
        tracing::debug!(
            identifier = person,
            path = %path.display(),
            representative = saved.is_some(),
            "embedding enrolled"
        );

        self.cache.insert(path);
        report.embeddings_added += 1;
        Ok(())
    }

    fn save_representative(&self, person: &str, image: &DynamicImage) -> Option<PathBuf> {
        let dest = self.layout.representative_path(person);
        match self.codec.encode(image, &dest) {
            Ok(()) => Some(dest),
            Err(e) => {
                tracing::warn!(identifier = person, error = %e, "could not save representative image");
                None
            }
        }
    }

    /// Top-level directory names under the source root.
    ///
    /// A missing source root counts as empty, which removes every identifier.
    fn current_folders(&self) -> Result<BTreeSet<String>, ReconcileError> {
        let entries = match fs::read_dir(&self.source_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.source_root.display(), "source directory does not exist");
                return Ok(BTreeSet::new());
            }
            Err(source) => {
                return Err(ReconcileError::Io {
                    path: self.source_root.clone(),
                    source,
                })
            }
        };

        let mut folders = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| ReconcileError::Io {
                path: self.source_root.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => {
                    folders.insert(name);
                }
                Err(raw) => tracing::warn!(name = ?raw, "skipping folder with non UTF-8 name"),
            }
        }
        Ok(folders)
    }

    /// Nearest enrolled identifier and its distance, `None` when nothing is enrolled.
    pub fn search(&self, embedding: &Embedding) -> Result<Option<Neighbor>, ReconcileError> {
        Ok(self.index.nearest(embedding)?)
    }

    pub fn recognize(&self, embedding: &Embedding, threshold: f32) -> Result<Recognition, ReconcileError> {
        Ok(query::recognize(&self.index, embedding, threshold)?)
    }

    /// Extract the face in `image` and recognise it. `None` when no face is found.
    pub fn identify(
        &mut self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<Option<(Face, Recognition)>, ReconcileError> {
        let Some(face) = self.extractor.extract(image)? else {
            return Ok(None);
        };
        let recognition = query::recognize(&self.index, &face.embedding, threshold)?;
        Ok(Some((face, recognition)))
    }

    /// Decode the file at `path`, then [`identify`](Self::identify) it.
    pub fn identify_file(
        &mut self,
        path: &Path,
        threshold: f32,
    ) -> Result<Option<(Face, Recognition)>, ReconcileError> {
        let image = self.codec.decode(path)?;
        self.identify(&image, threshold)
    }

    pub fn list_identifiers(&self) -> Result<Vec<String>, ReconcileError> {
        Ok(self.store.list_identifiers()?)
    }

    pub fn get_representative_image(&self, identifier: &str) -> Result<Option<PathBuf>, ReconcileError> {
        Ok(self.store.get_representative_image(identifier)?)
    }

    pub fn get_profile(&self, identifier: &str) -> Result<Option<Profile>, ReconcileError> {
        Ok(self.store.get_profile(identifier)?)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>, ReconcileError> {
        Ok(self.store.list_profiles()?)
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn cache(&self) -> &ProcessedPathCache {
        &self.cache
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }
}

/// Image files directly inside `folder`, sorted by path.
fn folder_images(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        if !path.is_file() || !has_image_extension(&path) {
            continue;
        }
        if path.to_str().is_none() {
            tracing::warn!(path = %path.display(), "skipping file with non UTF-8 path");
            continue;
        }
        images.push(path);
    }
    images.sort();
    Ok(images)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FsCodec;
    use crate::testing::{color_embedding, solid_image, ColorExtractor};
    use image::{ImageFormat, Rgb};
    use tempfile::TempDir;

    const RED: [u8; 3] = [220, 0, 0];
    const GREEN: [u8; 3] = [0, 220, 0];
    const BLUE: [u8; 3] = [0, 0, 220];
    const BLACK: [u8; 3] = [0, 0, 0];

    struct Fixture {
        root: TempDir,
        source: PathBuf,
        data: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("enroll_folder");
            let data = dir.path().join("data");
            fs::create_dir_all(&source).unwrap();
            Self { root: dir, source, data }
        }

        fn open(&self) -> Reconciler<ColorExtractor, FsCodec> {
            Reconciler::open(
                self.source.clone(),
                DataLayout::new(&self.data),
                ColorExtractor::default(),
                FsCodec,
            )
            .unwrap()
        }

        /// Write a solid-colour image; PNG bytes regardless of extension.
        fn put(&self, person: &str, file: &str, color: [u8; 3]) -> PathBuf {
            let folder = self.source.join(person);
            fs::create_dir_all(&folder).unwrap();
            let path = folder.join(file);
            solid_image(color)
                .save_with_format(&path, ImageFormat::Png)
                .unwrap();
            path
        }

        fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
            [DB_FILE, crate::index::VECTOR_FILE, crate::index::IDENTIFIER_FILE, CACHE_FILE]
                .iter()
                .map(|name| (name.to_string(), fs::read(self.data.join(name)).unwrap()))
                .collect()
        }
    }

    fn assert_counts_consistent(r: &Reconciler<ColorExtractor, FsCodec>) {
        for profile in r.list_profiles().unwrap() {
            assert_eq!(
                profile.embedding_count as usize,
                r.index().count_for(&profile.identifier),
                "count drift for {}",
                profile.identifier
            );
        }
        assert_eq!(
            r.index().identifiers(),
            r.list_identifiers().unwrap().into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_empty_index_has_no_enrolled_faces() {
        let fx = Fixture::new();
        let mut r = fx.open();
        let report = r.enroll_once().unwrap();

        assert!(!report.changed());
        assert!(!report.cache_saved);
        assert!(r.search(&color_embedding(RED)).unwrap().is_none());
        assert_eq!(
            r.recognize(&color_embedding(RED), 0.6).unwrap(),
            Recognition::NoEnrolledFaces
        );
    }

    #[test]
    fn test_first_enrollment_sets_profile_and_representative() {
        let fx = Fixture::new();
        let source_image = fx.put("alice", "1.jpg", RED);
        let mut r = fx.open();

        let report = r.enroll_once().unwrap();

        assert_eq!(report.new_identifiers, vec!["alice"]);
        assert_eq!(report.embeddings_added, 1);
        assert!(report.cache_saved);
        assert_eq!(r.list_identifiers().unwrap(), vec!["alice"]);

        let profile = r.get_profile("alice").unwrap().unwrap();
        assert_eq!(profile.embedding_count, 1);
        let representative = r.get_representative_image("alice").unwrap().unwrap();
        assert_eq!(representative, fx.data.join("alice_display.png"));
        let saved = FsCodec.decode(&representative).unwrap().to_rgb8();
        assert_eq!(saved.get_pixel(0, 0), &Rgb(RED));

        assert!(r.cache().contains(&source_image));
        let hit = r.search(&color_embedding(RED)).unwrap().unwrap();
        assert_eq!(hit.identifier, "alice");
        assert!(hit.distance.abs() < 1e-5);
        assert_counts_consistent(&r);
    }

    #[test]
    fn test_second_image_bumps_count_keeps_representative() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        let mut r = fx.open();
        r.enroll_once().unwrap();
        let first = r.get_profile("alice").unwrap().unwrap();

        fx.put("alice", "2.jpg", GREEN);
        let report = r.enroll_once().unwrap();

        assert_eq!(report.embeddings_added, 1);
        assert!(report.new_identifiers.is_empty());
        let profile = r.get_profile("alice").unwrap().unwrap();
        assert_eq!(profile.embedding_count, 2);
        assert_eq!(profile.representative_image, first.representative_image);
        assert_eq!(profile.enrolled_at, first.enrolled_at);

        let saved = FsCodec
            .decode(profile.representative_image.as_deref().unwrap())
            .unwrap()
            .to_rgb8();
        assert_eq!(saved.get_pixel(0, 0), &Rgb(RED));
        assert_eq!(r.index().count_for("alice"), 2);
        assert_counts_consistent(&r);
    }

    #[test]
    fn test_deleted_folder_removes_identifier_everywhere() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        fx.put("alice", "2.png", [200, 10, 0]);
        fx.put("bob", "1.jpg", BLUE);
        let mut r = fx.open();
        r.enroll_once().unwrap();
        let representative = r.get_representative_image("alice").unwrap().unwrap();
        assert!(representative.exists());

        fs::remove_dir_all(fx.source.join("alice")).unwrap();
        let report = r.enroll_once().unwrap();

        assert_eq!(report.removed, vec!["alice"]);
        assert_eq!(report.embeddings_removed, 2);
        assert_eq!(report.cache_purged, 2);
        assert!(report.cache_saved);
        assert_eq!(r.list_identifiers().unwrap(), vec!["bob"]);
        assert!(r.get_profile("alice").unwrap().is_none());
        assert!(!representative.exists());
        assert_eq!(r.index().count_for("alice"), 0);
        assert!(r.cache().iter().all(|p| !p.starts_with(fx.source.join("alice"))));

        for sample in [RED, GREEN, BLUE, [1, 1, 1], [255, 0, 255]] {
            let hit = r.search(&color_embedding(sample)).unwrap().unwrap();
            assert_ne!(hit.identifier, "alice");
        }
        assert_counts_consistent(&r);
    }

    #[test]
    fn test_faceless_and_corrupt_files_are_retried() {
        let fx = Fixture::new();
        let faceless = fx.put("alice", "dark.jpg", BLACK);
        let corrupt = fx.source.join("alice").join("broken.jpeg");
        fs::write(&corrupt, b"not an image").unwrap();
        let mut r = fx.open();

        let report = r.enroll_once().unwrap();
        assert!(r.list_identifiers().unwrap().is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.contains(&SkippedFile { path: corrupt.clone(), reason: SkipReason::Unreadable }));
        assert!(report.skipped.contains(&SkippedFile { path: faceless.clone(), reason: SkipReason::NoFace }));
        assert!(!report.cache_saved);
        assert!(!r.cache().contains(&faceless));
        let calls = r.extractor().calls;

        let report = r.enroll_once().unwrap();
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(r.extractor().calls, calls + 1);
        assert!(r.list_identifiers().unwrap().is_empty());
    }

    #[test]
    fn test_second_run_without_changes_is_byte_identical() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        fx.put("alice", "2.jpg", [230, 5, 0]);
        fx.put("bob", "a.png", BLUE);
        fx.put("bob", "b.PNG", BLACK);
        let mut r = fx.open();

        r.enroll_once().unwrap();
        let before = fx.snapshot();
        let report = r.enroll_once().unwrap();
        let after = fx.snapshot();

        assert!(!report.changed());
        assert!(!report.cache_saved);
        assert_eq!(before, after);
    }

    #[test]
    fn test_folder_rename_is_delete_then_enroll() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        let mut r = fx.open();
        r.enroll_once().unwrap();

        fs::rename(fx.source.join("alice"), fx.source.join("alicia")).unwrap();
        let report = r.enroll_once().unwrap();

        assert_eq!(report.removed, vec!["alice"]);
        assert_eq!(report.new_identifiers, vec!["alicia"]);
        assert_eq!(r.list_identifiers().unwrap(), vec!["alicia"]);
        assert_eq!(r.get_profile("alicia").unwrap().unwrap().embedding_count, 1);
        assert_eq!(
            r.get_representative_image("alicia").unwrap(),
            Some(fx.data.join("alicia_display.png"))
        );
        assert!(!fx.data.join("alice_display.png").exists());
        assert_eq!(r.cache().len(), 1);
        assert_counts_consistent(&r);
    }

    #[test]
    fn test_recreated_folder_is_enrolled_again() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        let mut r = fx.open();
        r.enroll_once().unwrap();

        fs::remove_dir_all(fx.source.join("alice")).unwrap();
        r.enroll_once().unwrap();
        fx.put("alice", "1.jpg", GREEN);
        let report = r.enroll_once().unwrap();

        assert_eq!(report.new_identifiers, vec!["alice"]);
        assert_eq!(r.index().count_for("alice"), 1);
        let hit = r.search(&color_embedding(GREEN)).unwrap().unwrap();
        assert_eq!(hit.identifier, "alice");
        assert!(hit.distance.abs() < 1e-5);
    }

    #[test]
    fn test_ignores_non_images_and_loose_files() {
        let fx = Fixture::new();
        fs::write(fx.source.join("README.txt"), b"top level file").unwrap();
        fx.put("alice", "notes.jpg.txt", RED);
        fx.put("alice", "3.PNG", RED);
        fx.put("alice", "4.JpEg", [240, 0, 0]);
        fs::create_dir_all(fx.source.join("alice").join("nested.jpg")).unwrap();
        let mut r = fx.open();

        let report = r.enroll_once().unwrap();

        assert_eq!(report.embeddings_added, 2);
        assert!(report.skipped.is_empty());
        assert_eq!(r.list_identifiers().unwrap(), vec!["alice"]);
        assert_eq!(r.get_profile("alice").unwrap().unwrap().embedding_count, 2);
    }

    #[test]
    fn test_missing_source_root_removes_everyone() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        let mut r = fx.open();
        r.enroll_once().unwrap();

        fs::remove_dir_all(&fx.source).unwrap();
        let report = r.enroll_once().unwrap();

        assert_eq!(report.removed, vec!["alice"]);
        assert!(r.index().is_empty());
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_reopen_loads_index_without_rebuild() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        fx.put("alice", "2.jpg", GREEN);
        {
            let mut r = fx.open();
            r.enroll_once().unwrap();
        }

        let mut r = fx.open();
        assert_eq!(r.extractor().calls, 0);
        assert_eq!(r.index().count_for("alice"), 2);
        assert_eq!(r.cache().len(), 2);
        let report = r.enroll_once().unwrap();
        assert_eq!(report.embeddings_added, 0);
        assert_eq!(r.extractor().calls, 0);
    }

    #[test]
    fn test_reopen_after_index_loss_rebuilds_from_representatives() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        fx.put("alice", "2.jpg", GREEN);
        fx.put("bob", "1.jpg", BLUE);
        {
            let mut r = fx.open();
            r.enroll_once().unwrap();
        }
        fs::remove_file(fx.data.join(crate::index::IDENTIFIER_FILE)).unwrap();

        let r = fx.open();

        assert_eq!(r.extractor().calls, 2);
        assert_eq!(r.index().count_for("alice"), 1);
        assert_eq!(r.index().count_for("bob"), 1);
        let hit = r.search(&color_embedding(RED)).unwrap().unwrap();
        assert_eq!(hit.identifier, "alice");
    }

    #[test]
    fn test_identify_file() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        fx.put("bob", "1.jpg", BLUE);
        let mut r = fx.open();
        r.enroll_once().unwrap();

        let sample = fx.root.path().join("sample.png");
        solid_image([250, 2, 0]).save(&sample).unwrap();
        let (_, recognition) = r.identify_file(&sample, 0.6).unwrap().unwrap();
        assert_eq!(recognition.identifier(), Some("alice"));

        let stranger = fx.root.path().join("stranger.png");
        solid_image([0, 200, 0]).save(&stranger).unwrap();
        let (_, recognition) = r.identify_file(&stranger, 0.6).unwrap().unwrap();
        assert!(matches!(recognition, Recognition::Unknown { .. }));

        let dark = fx.root.path().join("dark.png");
        solid_image(BLACK).save(&dark).unwrap();
        assert!(r.identify_file(&dark, 0.6).unwrap().is_none());
    }

    #[test]
    fn test_has_image_extension() {
        assert!(has_image_extension(Path::new("a/b/1.JPG")));
        assert!(has_image_extension(Path::new("x.jpeg")));
        assert!(has_image_extension(Path::new("x.Png")));
        assert!(!has_image_extension(Path::new("x.gif")));
        assert!(!has_image_extension(Path::new("jpg")));
    }

    #[test]
    fn test_data_layout_paths() {
        let layout = DataLayout::new("/var/lib/facewatch");
        assert_eq!(layout.db_path(), Path::new("/var/lib/facewatch/faces.db"));
        assert_eq!(layout.cache_path(), Path::new("/var/lib/facewatch/enrolled_paths.json"));
        assert_eq!(
            layout.representative_path("alice"),
            Path::new("/var/lib/facewatch/alice_display.png")
        );
        assert_eq!(layout.index_paths(), IndexPaths::in_dir(Path::new("/var/lib/facewatch")));
    }

    /// Gives green images a short embedding so the index rejects them.
    #[derive(Default)]
    struct ShortForGreen(ColorExtractor);

    impl EmbeddingExtractor for ShortForGreen {
        fn extract(&mut self, image: &DynamicImage) -> Result<Option<Face>, ExtractorError> {
            let green = image.to_rgb8().get_pixel(0, 0) == &Rgb(GREEN);
            let face = self.0.extract(image)?;
            Ok(face.map(|mut face| {
                if green {
                    face.embedding = Embedding::new(vec![1.0, 0.0, 0.0]);
                }
                face
            }))
        }
    }

    #[test]
    fn test_failed_run_records_files_enrolled_before_the_error() {
        let fx = Fixture::new();
        let first = fx.put("alice", "1.jpg", RED);
        fx.put("alice", "2.jpg", GREEN);
        {
            let mut r = Reconciler::open(
                fx.source.clone(),
                DataLayout::new(&fx.data),
                ShortForGreen::default(),
                FsCodec,
            )
            .unwrap();
            let err = r.enroll_once().unwrap_err();
            assert!(
                matches!(err, ReconcileError::Index(IndexError::DimensionMismatch { .. })),
                "got {err:?}"
            );
            assert_eq!(r.index().count_for("alice"), 1);
        }

        let saved = ProcessedPathCache::load(fx.data.join(CACHE_FILE)).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved.contains(&first));

        let mut r = fx.open();
        let report = r.enroll_once().unwrap();
        assert_eq!(report.embeddings_added, 1);
        assert_eq!(r.index().count_for("alice"), 2);
        assert_eq!(r.get_profile("alice").unwrap().unwrap().embedding_count, 2);
        assert_counts_consistent(&r);
    }

    #[test]
    fn test_undeletable_representative_does_not_block_removal() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        fx.put("bob", "1.jpg", BLUE);
        let mut r = fx.open();
        r.enroll_once().unwrap();

        let representative = r.get_representative_image("alice").unwrap().unwrap();
        fs::remove_file(&representative).unwrap();
        fs::create_dir_all(&representative).unwrap();
        fs::write(representative.join("keep.txt"), b"occupied").unwrap();
        fs::remove_dir_all(fx.source.join("alice")).unwrap();

        let report = r.enroll_once().unwrap();

        assert_eq!(report.removed, vec!["alice"]);
        assert!(r.get_profile("alice").unwrap().is_none());
        assert_eq!(r.index().count_for("alice"), 0);
        assert!(representative.is_dir());
        assert_eq!(r.list_identifiers().unwrap(), vec!["bob"]);
        assert_counts_consistent(&r);
    }

    #[test]
    fn test_missing_representative_does_not_block_removal() {
        let fx = Fixture::new();
        fx.put("alice", "1.jpg", RED);
        let mut r = fx.open();
        r.enroll_once().unwrap();

        let representative = r.get_representative_image("alice").unwrap().unwrap();
        fs::remove_file(&representative).unwrap();
        fs::remove_dir_all(fx.source.join("alice")).unwrap();

        let report = r.enroll_once().unwrap();

        assert_eq!(report.removed, vec!["alice"]);
        assert_eq!(report.embeddings_removed, 1);
        assert!(r.get_profile("alice").unwrap().is_none());
        assert!(r.index().is_empty());
    }
}
