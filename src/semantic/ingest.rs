//! Parallel ingestion of image files into a collection.
//!
//! 1. Resolve each stored path to a readable location
//! 2. Read files on a bounded worker pool, keeping input order
//! 3. Embed the readable images in fixed-size batches
//! 4. Append every successful vector to the index in one call

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::paths::PathResolver;
use crate::semantic::embeddings::{embed_images, Embedder};
use crate::semantic::store::{CollectionKey, IndexStore, StoreError};

/// One image to ingest: its id and the path recorded by the uploading application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestItem {
    #[serde(rename = "image_id")]
    pub id: u64,
    pub file_path: String,
}

/// An item that could not be embedded and is therefore not searchable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestFailure {
    #[serde(rename = "image_id")]
    pub id: u64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Ids appended to the index, in input order
    pub embedded: Vec<u64>,
    pub failed: Vec<IngestFailure>,
    /// Ids the collection already held; their stored vectors are unchanged
    #[serde(default)]
    pub skipped: Vec<u64>,
    /// Entries in the index after the append
    pub total: usize,
}

pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<IndexStore>,
    resolver: PathResolver,
    pool: rayon::ThreadPool,
    batch_size: usize,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<IndexStore>,
        resolver: PathResolver,
        load_workers: usize,
        batch_size: usize,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(load_workers.max(1))
            .thread_name(|i| format!("folio-load-{i}"))
            .build()?;

        Ok(Self {
            embedder,
            store,
            resolver,
            pool,
            batch_size: batch_size.max(1),
        })
    }

    /// Embed `items` and append them to the collection at `key`.
    ///
    /// The index must already exist. Unreadable or corrupt files are reported
    /// in `failed` and do not stop the rest of the batch. Ids already stored,
    /// or repeated in `items`, are reported in `skipped` and not embedded.
    pub fn ingest(&self, key: CollectionKey, items: &[IngestItem]) -> Result<IngestReport, StoreError> {
        let existing = self.store.load(key)?;

        let mut skipped = Vec::new();
        let mut seen = HashSet::with_capacity(items.len());
        let fresh: Vec<&IngestItem> = items
            .iter()
            .filter(|item| {
                let new = !existing.contains(item.id) && seen.insert(item.id);
                if !new {
                    skipped.push(item.id);
                }
                new
            })
            .collect();

        let paths: Vec<PathBuf> = fresh.iter().map(|i| self.resolver.resolve(&i.file_path)).collect();
        let loaded: Vec<Result<Vec<u8>, String>> =
            self.pool.install(|| paths.par_iter().map(|p| load_image(p)).collect());

        let mut failed = Vec::new();
        let mut ready_ids = Vec::with_capacity(fresh.len());
        let mut ready_bytes: Vec<&[u8]> = Vec::with_capacity(fresh.len());

        for (item, result) in fresh.iter().zip(loaded.iter()) {
            match result {
                Ok(bytes) => {
                    ready_ids.push(item.id);
                    ready_bytes.push(bytes.as_slice());
                }
                Err(error) => {
                    log::warn!("image {} ({}) skipped: {error}", item.id, item.file_path);
                    failed.push(IngestFailure {
                        id: item.id,
                        error: error.clone(),
                    });
                }
            }
        }

        let mut embedded = Vec::with_capacity(ready_ids.len());
        let mut vectors = Vec::with_capacity(ready_ids.len());

        let results = embed_images(self.embedder.as_ref(), &ready_bytes, self.batch_size);
        for (id, result) in ready_ids.into_iter().zip(results) {
            match result {
                Ok(vector) => {
                    embedded.push(id);
                    vectors.push(vector);
                }
                Err(e) => {
                    log::warn!("image {id} could not be embedded: {e}");
                    failed.push(IngestFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let total = if embedded.is_empty() {
            existing.len()
        } else {
            // a concurrent append may have stored some of these ids meanwhile
            let appended = self.store.append(key, vectors, &embedded)?;
            embedded.retain(|id| !appended.skipped.contains(id));
            skipped.extend(appended.skipped);
            appended.total
        };

        log::info!(
            "ingested {} of {} images into {key} ({} failed, {} skipped)",
            embedded.len(),
            items.len(),
            failed.len(),
            skipped.len()
        );

        Ok(IngestReport {
            embedded,
            failed,
            skipped,
            total,
        })
    }
}

fn load_image(path: &Path) -> Result<Vec<u8>, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    image::guess_format(&bytes)
        .map_err(|_| format!("{} is not a recognized image format", path.display()))?;
    Ok(bytes)
}
