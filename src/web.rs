use crate::{
    app::{local::LocalBackend, AppError, CreateOutcome, SearchBackend},
    config::Config,
    semantic::{IngestItem, IngestReport, RankedResult, SearchEngine, SearchTarget},
};
use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::signal;

const DEFAULT_TOP_K: usize = 5;

#[derive(Clone)]
struct SharedState {
    backend: Arc<dyn SearchBackend>,
    info: ServiceInfo,
    timeout: Duration,
}

/// Reported by `/` and `/health`.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceInfo {
    pub model: String,
    pub dimensions: usize,
}

pub fn router(backend: Arc<dyn SearchBackend>, info: ServiceInfo, timeout: Duration) -> Router {
    let shared_state = Arc::new(SharedState {
        backend,
        info,
        timeout,
    });

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/create-index", post(create_index))
        .route("/api/embed-images", post(embed_images))
        .route("/api/search", post(search))
        .route(
            "/api/delete-index/:owner_id/:collection_id",
            delete(delete_index),
        )
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(engine: Arc<SearchEngine>, listen: String, timeout: Duration) -> anyhow::Result<()> {
    let info = ServiceInfo {
        model: engine.embedder().model_name().to_string(),
        dimensions: engine.embedder().dimensions(),
    };
    let backend: Arc<dyn SearchBackend> = Arc::new(LocalBackend::new(engine));
    let app = router(backend, info, timeout);

    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {e}");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => log::error!("failed to install signal handler: {e}"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        log::warn!("shutting down");
    }

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    log::info!("listening on {listen}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn start_daemon(engine: Arc<SearchEngine>, config: &Config, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    let timeout = config.request_timeout();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(engine, listen, timeout).await })
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => {
                log::error!("{self:?}");
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Run blocking engine work off the async workers, bounded by the request timeout.
///
/// On timeout the work keeps running to completion in the background; only
/// the response is abandoned.
async fn run_blocking<T, F>(state: &SharedState, work: F) -> Result<T, HttpError>
where
    T: Send + 'static,
    F: FnOnce(&dyn SearchBackend) -> Result<T, AppError> + Send + 'static,
{
    let backend = state.backend.clone();
    let task = tokio::task::spawn_blocking(move || work(backend.as_ref()));

    match tokio::time::timeout(state.timeout, task).await {
        Ok(Ok(result)) => result.map_err(HttpError),
        Ok(Err(join_err)) => Err(HttpError(AppError::Other(anyhow::anyhow!(
            "engine task failed: {join_err}"
        )))),
        Err(_) => Err(HttpError(AppError::Timeout(state.timeout))),
    }
}

async fn root(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "folio",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.info.model,
        "dimensions": state.info.dimensions,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIndexRequest {
    pub owner_id: u64,
    pub collection_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexResponse {
    pub status: CreateOutcome,
}

async fn create_index(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<CreateIndexRequest>,
) -> Result<Json<CreateIndexResponse>, HttpError> {
    log::info!(
        "create index: owner={} collection={}",
        payload.owner_id,
        payload.collection_id
    );

    let CreateIndexRequest {
        owner_id,
        collection_id,
    } = payload;
    let status = run_blocking(&state, move |b| b.create_index(owner_id, collection_id)).await?;

    match status {
        CreateOutcome::AlreadyExists => Err(HttpError(AppError::AlreadyExists(format!(
            "index already exists for collection {collection_id} (owner {owner_id})"
        )))),
        status => Ok(Json(CreateIndexResponse { status })),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedImagesRequest {
    pub owner_id: u64,
    pub collection_id: u64,
    pub images: Vec<IngestItem>,
}

async fn embed_images(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<EmbedImagesRequest>,
) -> Result<Json<IngestReport>, HttpError> {
    log::info!(
        "embed request: owner={} collection={} count={}",
        payload.owner_id,
        payload.collection_id,
        payload.images.len()
    );

    let report = run_blocking(&state, move |b| {
        b.append_vectors(payload.owner_id, payload.collection_id, &payload.images)
    })
    .await?;

    Ok(Json(report))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub targets: Vec<SearchTarget>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<RankedResult>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::info!(
        "search request: query={:?} collections={}",
        payload.query,
        payload.targets.len()
    );

    let results = run_blocking(&state, move |b| {
        b.search(&payload.query, payload.top_k, &payload.targets)
    })
    .await?;

    log::info!("search completed: {} results", results.len());
    Ok(Json(SearchResponse { results }))
}

async fn delete_index(
    State(state): State<Arc<SharedState>>,
    Path((owner_id, collection_id)): Path<(u64, u64)>,
) -> Result<Json<serde_json::Value>, HttpError> {
    log::info!("delete index: owner={owner_id} collection={collection_id}");

    run_blocking(&state, move |b| b.delete_index(owner_id, collection_id)).await?;

    Ok(Json(json!({"message": "index deleted"})))
}
