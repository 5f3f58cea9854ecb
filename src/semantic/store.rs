//! Per-collection index lifecycle on local storage.
//!
//! Layout: `<root>/<owner_id>/<collection_id>.idx`, one file per collection.
//! Appends to one collection are serialized by an in-process lock keyed by
//! the collection; searches read whole files written by atomic rename and
//! take no lock.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::semantic::index::{IndexError, SearchResult, VectorIndex};
use crate::semantic::normalize::{normalize, normalize_rows};
use crate::semantic::storage::{VectorStorage, VectorStorageError};

/// Storage address of a collection: always the *owner's* id, never the caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionKey {
    pub owner_id: u64,
    pub collection_id: u64,
}

impl CollectionKey {
    pub fn new(owner_id: u64, collection_id: u64) -> Self {
        Self {
            owner_id,
            collection_id,
        }
    }

    /// Location of the index file relative to the store root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.owner_id.to_string()).join(format!("{}.idx", self.collection_id))
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection {} (owner {})", self.collection_id, self.owner_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index for {0} not found; create the index before adding vectors")]
    NotFound(CollectionKey),

    #[error("index for {0} already exists")]
    AlreadyExists(CollectionKey),

    #[error("storage error for {key}: {source}")]
    Storage {
        key: CollectionKey,
        #[source]
        source: VectorStorageError,
    },

    #[error("index error for {key}: {source}")]
    Index {
        key: CollectionKey,
        #[source]
        source: IndexError,
    },

    #[error("lock poisoned for {0}")]
    LockPoisoned(CollectionKey),
}

/// Result of one append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Appended {
    /// Ids that were already in the collection and were left unchanged
    pub skipped: Vec<u64>,
    /// Entries in the index afterwards
    pub total: usize,
}

pub struct IndexStore {
    root: PathBuf,
    model_id: [u8; 32],
    dimensions: usize,
    locks: Mutex<HashMap<CollectionKey, Arc<Mutex<()>>>>,
}

impl IndexStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// Every index file is stamped with `model_id` and `dimensions`; files
    /// written by a different model are rejected on load.
    pub fn open(root: PathBuf, model_id: [u8; 32], dimensions: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            model_id,
            dimensions,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, key: CollectionKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    #[cfg(test)]
    pub fn exists(&self, key: CollectionKey) -> bool {
        self.path_for(key).exists()
    }

    /// Create an empty index. Fails with `AlreadyExists` if a file is present.
    pub fn create(&self, key: CollectionKey) -> Result<(), StoreError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned(key))?;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage_err(key, e.into()))?;
        }

        match VectorStorage::new(path).save_new(&VectorIndex::new(self.dimensions), &self.model_id) {
            Ok(()) => {
                log::info!("created index for {key}");
                Ok(())
            }
            Err(VectorStorageError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(key))
            }
            Err(e) => Err(storage_err(key, e)),
        }
    }

    /// Append `vectors` under `ids` in one read-modify-write cycle.
    ///
    /// Vectors are normalized here regardless of what the caller did. Ids the
    /// collection already holds are skipped, so replaying a request is harmless.
    pub fn append(
        &self,
        key: CollectionKey,
        mut vectors: Vec<Vec<f32>>,
        ids: &[u64],
    ) -> Result<Appended, StoreError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned(key))?;

        let mut index = self.load(key)?;

        normalize_rows(&mut vectors);
        let skipped = index
            .append(ids, vectors)
            .map_err(|source| StoreError::Index { key, source })?;

        let added = ids.len() - skipped.len();
        if added > 0 {
            VectorStorage::new(self.path_for(key))
                .save(&index, &self.model_id)
                .map_err(|e| storage_err(key, e))?;
        }
        if !skipped.is_empty() {
            log::warn!("{} ids already in {key}, skipped", skipped.len());
        }

        log::info!("appended {added} vectors to {key} ({} total)", index.len());
        Ok(Appended {
            skipped,
            total: index.len(),
        })
    }

    /// Top-`k` entries of one collection by inner product with `query`.
    pub fn search(
        &self,
        key: CollectionKey,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let index = self.load(key)?;
        index
            .search(&normalize(query), k)
            .map_err(|source| StoreError::Index { key, source })
    }

    /// Remove the index file. A missing file is not an error.
    ///
    /// Returns whether a file was actually removed.
    pub fn delete(&self, key: CollectionKey) -> Result<bool, StoreError> {
        let lock = self.lock_for(key);
        let guard = lock.lock().map_err(|_| StoreError::LockPoisoned(key))?;

        let removed = VectorStorage::new(self.path_for(key))
            .delete()
            .map_err(|e| storage_err(key, e))?;

        drop(guard);
        self.release_lock(key, lock);

        if removed {
            log::info!("deleted index for {key}");
        } else {
            log::debug!("delete of {key}: no index file present");
        }
        Ok(removed)
    }

    /// Load a collection's index into memory.
    pub fn load(&self, key: CollectionKey) -> Result<VectorIndex, StoreError> {
        match VectorStorage::new(self.path_for(key)).load(&self.model_id, self.dimensions) {
            Ok(index) => Ok(index),
            Err(VectorStorageError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key))
            }
            Err(e) => Err(storage_err(key, e)),
        }
    }

    fn lock_for(&self, key: CollectionKey) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_default().clone()
    }

    /// Forget the lock of a deleted collection unless another caller holds it.
    fn release_lock(&self, key: CollectionKey, lock: Arc<Mutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        // one reference in the map, one here
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

fn storage_err(key: CollectionKey, source: VectorStorageError) -> StoreError {
    StoreError::Storage { key, source }
}
