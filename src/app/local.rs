use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use anyhow::anyhow;

use crate::semantic::{
    EngineError, IngestItem, IngestReport, RankedResult, SearchEngine, SearchTarget,
};

use super::{
    backend::{CreateOutcome, SearchBackend},
    errors::AppError,
};

/// Calls the engine in-process.
///
/// With a timeout set, each call runs on its own thread and the caller gets
/// `AppError::Timeout` once the bound passes; the call itself finishes in the
/// background.
pub struct LocalBackend {
    engine: Arc<SearchEngine>,
    timeout: Option<Duration>,
}

impl LocalBackend {
    pub fn new(engine: Arc<SearchEngine>) -> Self {
        Self {
            engine,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn run<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&SearchEngine) -> Result<T, EngineError> + Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return Ok(op(&*self.engine)?);
        };

        let engine = self.engine.clone();
        let (tx, rx) = mpsc::sync_channel(1);
        std::thread::Builder::new()
            .name("folio-engine-call".to_string())
            .spawn(move || {
                // the receiver is gone once the caller has timed out
                let _ = tx.send(op(&*engine));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => Ok(result?),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("engine call exceeded {timeout:?}");
                Err(AppError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(anyhow!("engine call ended without a result").into())
            }
        }
    }
}

impl SearchBackend for LocalBackend {
    fn create_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<CreateOutcome, AppError> {
        match self.run(move |engine| engine.create_index(owner_id, collection_id)) {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(AppError::AlreadyExists(_)) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    fn append_vectors(
        &self,
        owner_id: u64,
        collection_id: u64,
        items: &[IngestItem],
    ) -> anyhow::Result<IngestReport, AppError> {
        let items = items.to_vec();
        self.run(move |engine| engine.append_vectors(owner_id, collection_id, &items))
    }

    fn search(
        &self,
        query: &str,
        top_k: usize,
        targets: &[SearchTarget],
    ) -> anyhow::Result<Vec<RankedResult>, AppError> {
        let query = query.to_string();
        let targets = targets.to_vec();
        self.run(move |engine| engine.search(&query, top_k, &targets))
    }

    fn delete_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<(), AppError> {
        self.run(move |engine| engine.delete_index(owner_id, collection_id))?;
        Ok(())
    }
}
