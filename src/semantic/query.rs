//! Federated top-K search across many collections.
//!
//! The query text is embedded once. Each target collection is searched for
//! its own top-K, and every hit is offered to a min-heap capped at K, so
//! memory stays bounded no matter how many collections are named.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::{embed_text, Embedder, EmbeddingError};
use crate::semantic::index::SearchResult;
use crate::semantic::store::{CollectionKey, IndexStore, StoreError};

/// A collection the caller may search, with the id of the user who owns it.
///
/// Authorization is decided before this point; the owner id only locates the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchTarget {
    pub collection_id: u64,
    pub owner_id: u64,
}

impl SearchTarget {
    pub fn key(&self) -> CollectionKey {
        CollectionKey::new(self.owner_id, self.collection_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    #[serde(rename = "image_id")]
    pub id: u64,
    pub score: f32,
    pub collection_id: u64,
}

/// Upper bound on heap slots reserved up front; `k` comes from the caller.
const MAX_PREALLOCATED: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to embed query: {0}")]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate(RankedResult);

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.score.total_cmp(&other.0.score)
    }
}

/// Keeps the K highest-scoring results offered to it.
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(MAX_PREALLOCATED)),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert while below K; afterwards replace the minimum only if `result` beats it.
    pub fn offer(&mut self, result: RankedResult) {
        if self.k == 0 {
            return;
        }

        if self.heap.len() < self.k {
            self.heap.push(Reverse(Candidate(result)));
            return;
        }

        let beats_min = self
            .heap
            .peek()
            .map(|Reverse(min)| result.score > min.0.score)
            .unwrap_or(false);
        if beats_min {
            self.heap.pop();
            self.heap.push(Reverse(Candidate(result)));
        }
    }

    /// Drain into a list sorted by score, highest first.
    pub fn into_sorted_vec(self) -> Vec<RankedResult> {
        // ascending order of Reverse is descending order of score
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(Candidate(r))| r)
            .collect()
    }
}

pub struct FederatedQuery {
    embedder: Arc<dyn Embedder>,
    store: Arc<IndexStore>,
    parallel: bool,
}

impl FederatedQuery {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<IndexStore>) -> Self {
        Self {
            embedder,
            store,
            parallel: false,
        }
    }

    /// Search collections concurrently. Results are merged in target order either way.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Embed `query` once and return the global top-`k` across `targets`.
    ///
    /// Collections without an index file are skipped, as are collections that
    /// fail to load; neither aborts the query.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        targets: &[SearchTarget],
    ) -> Result<Vec<RankedResult>, QueryError> {
        let targets = dedup_targets(targets);
        if k == 0 || targets.is_empty() {
            return Ok(vec![]);
        }

        let query_vector = embed_text(self.embedder.as_ref(), query)?;

        let search_one = |target: &SearchTarget| -> Option<Vec<SearchResult>> {
            match self.store.search(target.key(), &query_vector, k) {
                Ok(hits) => Some(hits),
                Err(StoreError::NotFound(key)) => {
                    log::warn!("no index for {key}, skipping");
                    None
                }
                Err(e) => {
                    log::error!("search failed, skipping: {e}");
                    None
                }
            }
        };

        let partials: Vec<Option<Vec<SearchResult>>> = if self.parallel {
            targets.par_iter().map(search_one).collect()
        } else {
            targets.iter().map(search_one).collect()
        };

        let mut top = TopK::new(k);
        let mut skipped = 0usize;
        for (target, partial) in targets.iter().zip(partials) {
            let Some(hits) = partial else {
                skipped += 1;
                continue;
            };
            for hit in hits {
                top.offer(RankedResult {
                    id: hit.id,
                    score: hit.score,
                    collection_id: target.collection_id,
                });
            }
        }

        let results = top.into_sorted_vec();
        log::info!(
            "search over {} collections ({skipped} skipped): {} results",
            targets.len(),
            results.len()
        );
        Ok(results)
    }
}

fn dedup_targets(targets: &[SearchTarget]) -> Vec<SearchTarget> {
    let mut seen = HashSet::with_capacity(targets.len());
    targets.iter().copied().filter(|t| seen.insert(*t)).collect()
}
