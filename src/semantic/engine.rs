//! The search engine as one unit: one embedder, one index store, the
//! ingestion pipeline and the federated query engine sharing both.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::paths::PathResolver;
use crate::semantic::embeddings::{ClipEmbedder, Embedder, EmbeddingError};
use crate::semantic::ingest::{IngestItem, IngestPipeline, IngestReport};
use crate::semantic::query::{FederatedQuery, QueryError, RankedResult, SearchTarget};
use crate::semantic::store::{CollectionKey, IndexStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("model {model} produces {got} dimensions, config expects {expected}")]
    ModelDimensions {
        model: String,
        expected: usize,
        got: usize,
    },

    #[error("failed to open index directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start loader pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub index_dir: PathBuf,
    pub batch_size: usize,
    pub load_workers: usize,
    pub parallel_search: bool,
}

pub struct SearchEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<IndexStore>,
    ingest: IngestPipeline,
    query: FederatedQuery,
}

impl SearchEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        resolver: PathResolver,
        opts: EngineOptions,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(IndexStore::open(
            opts.index_dir,
            embedder.model_id_hash(),
            embedder.dimensions(),
        )?);

        let ingest = IngestPipeline::new(
            embedder.clone(),
            store.clone(),
            resolver,
            opts.load_workers,
            opts.batch_size,
        )?;
        let query = FederatedQuery::new(embedder.clone(), store.clone()).parallel(opts.parallel_search);

        Ok(Self {
            embedder,
            store,
            ingest,
            query,
        })
    }

    /// Load the configured model and open the index directory.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let resolver = PathResolver::for_process(&config.container_root(), &config.local_root()).clone();

        let embedder = ClipEmbedder::new(&config.model, PathBuf::from(config.base_path()))?;
        if embedder.dimensions() != config.dimensions {
            return Err(EngineError::ModelDimensions {
                model: config.model.clone(),
                expected: config.dimensions,
                got: embedder.dimensions(),
            });
        }

        let index_dir = config
            .index_dir
            .clone()
            .unwrap_or_else(|| resolver.index_dir());
        log::info!("index directory: {}", index_dir.display());

        Self::new(
            Arc::new(embedder),
            resolver,
            EngineOptions {
                index_dir,
                batch_size: config.batch_size,
                load_workers: config.load_workers,
                parallel_search: config.parallel_search,
            },
        )
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn create_index(&self, owner_id: u64, collection_id: u64) -> Result<(), EngineError> {
        Ok(self.store.create(CollectionKey::new(owner_id, collection_id))?)
    }

    pub fn append_vectors(
        &self,
        owner_id: u64,
        collection_id: u64,
        items: &[IngestItem],
    ) -> Result<IngestReport, EngineError> {
        Ok(self
            .ingest
            .ingest(CollectionKey::new(owner_id, collection_id), items)?)
    }

    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        targets: &[SearchTarget],
    ) -> Result<Vec<RankedResult>, EngineError> {
        Ok(self.query.search(query, top_k, targets)?)
    }

    /// Idempotent: returns `Ok(false)` when there was nothing to delete.
    pub fn delete_index(&self, owner_id: u64, collection_id: u64) -> Result<bool, EngineError> {
        Ok(self.store.delete(CollectionKey::new(owner_id, collection_id))?)
    }
}
