//! In-memory vector index with exact inner-product search.
//!
//! A collection's vectors live here between a load from disk and the next
//! save. Entries keep insertion order and are never updated or removed. An id
//! appears at most once; later writes of a known id are skipped.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::semantic::normalize::dot;

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// Caller-supplied identifier (e.g. an image id)
    pub id: u64,
    /// The embedding vector, unit length when written through the store
    pub embedding: Vec<f32>,
}

/// Ordered, append-only vector index.
pub struct VectorIndex {
    entries: Vec<VectorEntry>,
    known: HashSet<u64>,
    dimensions: usize,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: u64,
    /// Inner product with the query, in [-1, 1] for unit vectors
    pub score: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: Vec::new(),
            known: HashSet::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            known: HashSet::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a single entry at the end of the index.
    ///
    /// Returns `false` and leaves the index unchanged if `id` is already present.
    pub fn push(&mut self, id: u64, embedding: Vec<f32>) -> Result<bool, IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if !self.known.insert(id) {
            return Ok(false);
        }
        self.entries.push(VectorEntry { id, embedding });
        Ok(true)
    }

    /// Append a batch of entries, pairing `ids[i]` with `vectors[i]`.
    ///
    /// The batch is validated up front so a bad row leaves the index untouched.
    /// Ids already in the index, or repeated within the batch, keep their first
    /// vector; they are returned in input order.
    pub fn append(&mut self, ids: &[u64], vectors: Vec<Vec<f32>>) -> Result<Vec<u64>, IndexError> {
        if ids.len() != vectors.len() {
            return Err(IndexError::LengthMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }

        let mut skipped = Vec::new();
        self.entries.reserve(ids.len());
        for (&id, embedding) in ids.iter().zip(vectors) {
            if self.known.insert(id) {
                self.entries.push(VectorEntry { id, embedding });
            } else {
                skipped.push(id);
            }
        }

        Ok(skipped)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.known.contains(&id)
    }

    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &VectorEntry> {
        self.entries.iter()
    }

    /// Return the `k` entries with the highest inner product against `query`.
    ///
    /// Exhaustive scan. Fewer than `k` entries yields all of them; an empty
    /// index yields an empty list. Results are sorted by score, highest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .map(|entry| SearchResult {
                id: entry.id,
                score: dot(query, &entry.embedding),
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        results.truncate(k);

        Ok(results)
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Length mismatch: {ids} ids for {vectors} vectors")]
    LengthMismatch { ids: usize, vectors: usize },
}
