use serde::{Deserialize, Serialize};

use crate::semantic::{IngestItem, IngestReport, RankedResult, SearchTarget};

use super::errors::AppError;

/// The four operations the application calls on the search engine.
pub trait SearchBackend: Send + Sync {
    fn create_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<CreateOutcome, AppError>;

    fn append_vectors(
        &self,
        owner_id: u64,
        collection_id: u64,
        items: &[IngestItem],
    ) -> anyhow::Result<IngestReport, AppError>;

    fn search(
        &self,
        query: &str,
        top_k: usize,
        targets: &[SearchTarget],
    ) -> anyhow::Result<Vec<RankedResult>, AppError>;

    /// Succeeds whether or not the index existed.
    fn delete_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    /// The engine was unavailable; creation was skipped
    Deferred,
}
