use crate::semantic::{IngestFailure, IngestItem, IngestReport, RankedResult, SearchTarget};

use super::{
    backend::{CreateOutcome, SearchBackend},
    breaker::{BreakerError, BreakerState, CircuitBreaker},
    errors::AppError,
    failed::{FailedRequest, FailedRequestJournal, RetrySummary},
};

/// Wraps a backend with a circuit breaker and per-operation fallbacks.
///
/// When the circuit is open or a call fails for a transient reason:
/// search answers with no results, embedding and deletion are journaled for
/// a later retry, and index creation is skipped with a warning. Missing or
/// duplicate indexes are passed through unchanged.
pub struct ResilientBackend {
    inner: Box<dyn SearchBackend>,
    breaker: CircuitBreaker,
    journal: Option<FailedRequestJournal>,
}

impl ResilientBackend {
    pub fn new(
        inner: Box<dyn SearchBackend>,
        breaker: CircuitBreaker,
        journal: Option<FailedRequestJournal>,
    ) -> Self {
        Self {
            inner,
            breaker,
            journal,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn journal(&self) -> Option<&FailedRequestJournal> {
        self.journal.as_ref()
    }

    fn guarded<T>(
        &self,
        op: impl FnOnce(&dyn SearchBackend) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        self.breaker
            .call_with(|| op(self.inner.as_ref()), AppError::is_transient)
            .map_err(|err| match err {
                BreakerError::Open => AppError::CircuitOpen,
                BreakerError::Inner(e) => e,
            })
    }

    fn journal_failure(&self, request: FailedRequest, err: &AppError) {
        let Some(journal) = &self.journal else {
            log::warn!("no failed request journal configured, dropping request");
            return;
        };
        if let Err(e) = journal.record(request, &err.to_string()) {
            log::error!("failed to record failed request: {e}");
        }
    }

    /// Replay journaled requests through the breaker without fallbacks.
    pub fn retry_failed(&self) -> anyhow::Result<RetrySummary, AppError> {
        let Some(journal) = &self.journal else {
            return Ok(RetrySummary::default());
        };

        let summary = journal.retry_pending(|request| match request {
            FailedRequest::Embed {
                owner_id,
                collection_id,
                items,
            } => self
                .guarded(|b| b.append_vectors(*owner_id, *collection_id, items))
                .map(|report| {
                    if !report.failed.is_empty() {
                        log::warn!(
                            "{} items of a retried batch could not be embedded",
                            report.failed.len()
                        );
                    }
                }),
            FailedRequest::DeleteIndex {
                owner_id,
                collection_id,
            } => self.guarded(|b| b.delete_index(*owner_id, *collection_id)),
        })?;

        Ok(summary)
    }
}

impl SearchBackend for ResilientBackend {
    fn create_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<CreateOutcome, AppError> {
        match self.guarded(|b| b.create_index(owner_id, collection_id)) {
            Err(e) if e.is_transient() => {
                log::warn!(
                    "skipping index creation for collection {collection_id} (owner {owner_id}): {e}"
                );
                Ok(CreateOutcome::Deferred)
            }
            result => result,
        }
    }

    fn append_vectors(
        &self,
        owner_id: u64,
        collection_id: u64,
        items: &[IngestItem],
    ) -> anyhow::Result<IngestReport, AppError> {
        match self.guarded(|b| b.append_vectors(owner_id, collection_id, items)) {
            Err(e) if e.is_transient() => {
                log::warn!(
                    "embedding {} images for collection {collection_id} (owner {owner_id}) deferred: {e}",
                    items.len()
                );
                self.journal_failure(
                    FailedRequest::Embed {
                        owner_id,
                        collection_id,
                        items: items.to_vec(),
                    },
                    &e,
                );

                let failed = items
                    .iter()
                    .map(|item| IngestFailure {
                        id: item.id,
                        error: format!("deferred for retry: {e}"),
                    })
                    .collect();
                Ok(IngestReport {
                    embedded: vec![],
                    failed,
                    skipped: vec![],
                    total: 0,
                })
            }
            result => result,
        }
    }

    fn search(
        &self,
        query: &str,
        top_k: usize,
        targets: &[SearchTarget],
    ) -> anyhow::Result<Vec<RankedResult>, AppError> {
        match self.guarded(|b| b.search(query, top_k, targets)) {
            Ok(results) => Ok(results),
            Err(e) => {
                log::warn!("search unavailable, returning no results: {e}");
                Ok(vec![])
            }
        }
    }

    fn delete_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<(), AppError> {
        match self.guarded(|b| b.delete_index(owner_id, collection_id)) {
            Err(e) if e.is_transient() => {
                log::warn!(
                    "deleting index for collection {collection_id} (owner {owner_id}) deferred: {e}"
                );
                self.journal_failure(
                    FailedRequest::DeleteIndex {
                        owner_id,
                        collection_id,
                    },
                    &e,
                );
                Ok(())
            }
            result => result,
        }
    }
}
