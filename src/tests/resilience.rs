use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    app::{
        breaker::{BreakerSettings, BreakerState, CircuitBreaker},
        failed::{FailedRequest, FailedRequestJournal, FailedStatus},
        local::LocalBackend,
        resilient::ResilientBackend,
        AppError, CreateOutcome, SearchBackend,
    },
    semantic::{
        embeddings::{Embedder, EmbeddingError},
        IngestItem, IngestReport, RankedResult, SearchTarget,
    },
    storage::DataDir,
};

use super::support::{ColorEmbedder, TestEngine};

#[derive(Default)]
struct FlakyState {
    down: AtomicBool,
    calls: AtomicUsize,
}

/// Answers every call, or fails every call while `down` is set.
#[derive(Clone, Default)]
struct FlakyBackend {
    state: Arc<FlakyState>,
}

impl FlakyBackend {
    fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), AppError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if self.state.down.load(Ordering::SeqCst) {
            return Err(AppError::Remote("connection refused".into()));
        }
        Ok(())
    }
}

impl SearchBackend for FlakyBackend {
    fn create_index(&self, _owner_id: u64, _collection_id: u64) -> anyhow::Result<CreateOutcome, AppError> {
        self.enter()?;
        Ok(CreateOutcome::Created)
    }

    fn append_vectors(
        &self,
        _owner_id: u64,
        _collection_id: u64,
        items: &[IngestItem],
    ) -> anyhow::Result<IngestReport, AppError> {
        self.enter()?;
        Ok(IngestReport {
            embedded: items.iter().map(|i| i.id).collect(),
            failed: vec![],
            skipped: vec![],
            total: items.len(),
        })
    }

    fn search(
        &self,
        _query: &str,
        _top_k: usize,
        targets: &[SearchTarget],
    ) -> anyhow::Result<Vec<RankedResult>, AppError> {
        self.enter()?;
        Ok(targets
            .iter()
            .map(|t| RankedResult {
                id: 1,
                score: 0.5,
                collection_id: t.collection_id,
            })
            .collect())
    }

    fn delete_index(&self, _owner_id: u64, _collection_id: u64) -> anyhow::Result<(), AppError> {
        self.enter()
    }
}

fn settings(cooldown: Duration) -> BreakerSettings {
    BreakerSettings {
        failure_rate_threshold: 0.5,
        window_size: 4,
        minimum_calls: 4,
        open_cooldown: cooldown,
        half_open_trials: 1,
    }
}

fn resilient(
    inner: Box<dyn SearchBackend>,
    dir: &std::path::Path,
    cooldown: Duration,
) -> ResilientBackend {
    let journal = FailedRequestJournal::new(DataDir::new(dir).unwrap(), 3);
    ResilientBackend::new(
        inner,
        CircuitBreaker::new("test", settings(cooldown)),
        Some(journal),
    )
}

fn target() -> SearchTarget {
    SearchTarget {
        collection_id: 10,
        owner_id: 1,
    }
}

fn items() -> Vec<IngestItem> {
    vec![IngestItem {
        id: 5,
        file_path: "images/5.png".into(),
    }]
}

#[test]
fn test_calls_pass_through_while_healthy() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky = FlakyBackend::default();
    let backend = resilient(Box::new(flaky.clone()), tmp.path(), Duration::from_secs(60));

    assert_eq!(backend.create_index(1, 10).unwrap(), CreateOutcome::Created);
    assert_eq!(backend.search("red", 5, &[target()]).unwrap().len(), 1);
    assert_eq!(backend.append_vectors(1, 10, &items()).unwrap().embedded, vec![5]);
    backend.delete_index(1, 10).unwrap();

    assert_eq!(flaky.calls(), 4);
    assert_eq!(backend.breaker_state(), BreakerState::Closed);
}

#[test]
fn test_breaker_opens_and_stops_forwarding() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky = FlakyBackend::default();
    flaky.set_down(true);
    let backend = resilient(Box::new(flaky.clone()), tmp.path(), Duration::from_secs(60));

    for _ in 0..4 {
        assert!(backend.search("red", 5, &[target()]).unwrap().is_empty());
    }
    assert_eq!(flaky.calls(), 4);
    assert_eq!(backend.breaker_state(), BreakerState::Open);

    // open: fallbacks answer without reaching the engine
    assert!(backend.search("red", 5, &[target()]).unwrap().is_empty());
    assert_eq!(backend.create_index(1, 11).unwrap(), CreateOutcome::Deferred);
    assert_eq!(flaky.calls(), 4);
}

#[test]
fn test_fallbacks_journal_embed_and_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky = FlakyBackend::default();
    flaky.set_down(true);
    let backend = resilient(Box::new(flaky.clone()), tmp.path(), Duration::from_secs(60));

    let report = backend.append_vectors(1, 10, &items()).unwrap();
    assert!(report.embedded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, 5);
    assert!(report.failed[0].error.contains("deferred"));

    backend.delete_index(1, 10).unwrap();

    let entries = backend.journal().unwrap().entries().unwrap();
    let requests: Vec<FailedRequest> = entries.into_iter().map(|e| e.request).collect();
    assert_eq!(
        requests,
        vec![
            FailedRequest::Embed {
                owner_id: 1,
                collection_id: 10,
                items: items(),
            },
            FailedRequest::DeleteIndex {
                owner_id: 1,
                collection_id: 10,
            },
        ]
    );
}

#[test]
fn test_recovery_after_cooldown_and_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky = FlakyBackend::default();
    flaky.set_down(true);
    let backend = resilient(Box::new(flaky.clone()), tmp.path(), Duration::from_millis(20));

    for _ in 0..4 {
        backend.delete_index(1, 10).unwrap();
    }
    assert_eq!(backend.breaker_state(), BreakerState::Open);
    assert_eq!(backend.journal().unwrap().entries().unwrap().len(), 4);

    flaky.set_down(false);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(backend.breaker_state(), BreakerState::HalfOpen);

    let summary = backend.retry_failed().unwrap();

    assert_eq!(summary.succeeded, 4);
    assert!(backend.journal().unwrap().entries().unwrap().is_empty());
    assert_eq!(backend.breaker_state(), BreakerState::Closed);
}

#[test]
fn test_missing_index_passes_through_without_tripping() {
    let t = TestEngine::new();
    let backend = resilient(
        Box::new(LocalBackend::new(t.engine.clone())),
        t.tmp.path(),
        Duration::from_secs(60),
    );

    for _ in 0..6 {
        let result = backend.append_vectors(1, 10, &items());
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    assert_eq!(backend.breaker_state(), BreakerState::Closed);
    assert!(backend.journal().unwrap().entries().unwrap().is_empty());
}

#[test]
fn test_local_create_reports_existing_index() {
    let t = TestEngine::new();
    let backend = resilient(
        Box::new(LocalBackend::new(t.engine.clone())),
        t.tmp.path(),
        Duration::from_secs(60),
    );

    assert_eq!(backend.create_index(1, 10).unwrap(), CreateOutcome::Created);
    assert_eq!(backend.create_index(1, 10).unwrap(), CreateOutcome::AlreadyExists);
}

#[test]
fn test_retry_while_open_keeps_entries_pending() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky = FlakyBackend::default();
    flaky.set_down(true);
    let backend = resilient(Box::new(flaky.clone()), tmp.path(), Duration::from_millis(400));

    for _ in 0..4 {
        backend.delete_index(1, 10).unwrap();
    }
    assert_eq!(backend.breaker_state(), BreakerState::Open);
    let calls = flaky.calls();

    // more passes than the journal's attempt limit
    for _ in 0..4 {
        let summary = backend.retry_failed().unwrap();
        assert_eq!(summary.not_attempted, 4);
    }

    assert_eq!(flaky.calls(), calls);
    let entries = backend.journal().unwrap().entries().unwrap();
    assert_eq!(entries.len(), 4);
    for entry in &entries {
        assert_eq!(entry.status, FailedStatus::Pending);
        assert_eq!(entry.attempts, 0);
    }

    flaky.set_down(false);
    std::thread::sleep(Duration::from_millis(450));
    let summary = backend.retry_failed().unwrap();

    assert_eq!(summary.succeeded, 4);
    assert!(backend.journal().unwrap().entries().unwrap().is_empty());
}

/// Answers text queries only after a delay.
struct StallingEmbedder {
    inner: ColorEmbedder,
    delay: Duration,
}

impl Embedder for StallingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn text_features(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        std::thread::sleep(self.delay);
        self.inner.text_features(text)
    }

    fn image_features(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.inner.image_features(images)
    }
}

#[test]
fn test_stalled_local_engine_times_out_and_trips_breaker() {
    let t = TestEngine::new();
    t.engine.create_index(1, 10).unwrap();

    let stalling = Arc::new(StallingEmbedder {
        inner: ColorEmbedder::new(),
        delay: Duration::from_millis(300),
    });
    let engine = TestEngine::open_with(t.tmp.path(), stalling, false);

    let local = LocalBackend::new(engine.clone()).with_timeout(Duration::from_millis(20));
    let result = local.search("red", 5, &[target()]);
    assert!(matches!(result, Err(AppError::Timeout(_))));

    let patient = LocalBackend::new(engine.clone()).with_timeout(Duration::from_secs(5));
    assert_eq!(patient.create_index(1, 11).unwrap(), CreateOutcome::Created);
    assert_eq!(patient.create_index(1, 11).unwrap(), CreateOutcome::AlreadyExists);
    assert_eq!(patient.search("red", 5, &[target()]).unwrap(), vec![]);

    let backend = resilient(
        Box::new(LocalBackend::new(engine).with_timeout(Duration::from_millis(20))),
        t.tmp.path(),
        Duration::from_secs(60),
    );
    for _ in 0..4 {
        assert!(backend.search("red", 5, &[target()]).unwrap().is_empty());
    }
    assert_eq!(backend.breaker_state(), BreakerState::Open);
}
