use crate::{
    app::{
        breaker::{BreakerSettings, CircuitBreaker},
        failed::FailedRequestJournal,
        local::LocalBackend,
        remote::RemoteBackend,
        resilient::ResilientBackend,
        SearchBackend,
    },
    config::Config,
    semantic::SearchEngine,
    storage::DataDir,
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::sync::Arc;

const BREAKER_NAME: &str = "search-engine";

/// Builds the engine, config and backends from the environment.
pub struct AppFactory;

impl AppFactory {
    /// Get application paths, creating the base directory.
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths { base_path })
    }

    pub fn create_config(base_path: &str) -> Result<Config> {
        Config::load_with(base_path).with_context(|| format!("failed to load config from {base_path}"))
    }

    /// Load the embedding model and open the index directory.
    pub fn create_engine(config: &Config) -> Result<Arc<SearchEngine>> {
        let engine = SearchEngine::from_config(config).context("failed to start search engine")?;
        Ok(Arc::new(engine))
    }

    /// The backend CLI commands talk to: remote when `FOLIO_ADDR` is set,
    /// in-process otherwise, wrapped with the circuit breaker either way.
    pub fn create_backend(config: &Config) -> Result<ResilientBackend> {
        let inner: Box<dyn SearchBackend> = match std::env::var("FOLIO_ADDR") {
            Ok(addr) => {
                log::info!("Using remote backend: {addr}");
                Box::new(RemoteBackend::new(&addr, config.request_timeout())?)
            }
            Err(_) => Box::new(
                LocalBackend::new(Self::create_engine(config)?).with_timeout(config.request_timeout()),
            ),
        };

        Self::wrap(inner, config)
    }

    pub fn wrap(inner: Box<dyn SearchBackend>, config: &Config) -> Result<ResilientBackend> {
        let breaker = CircuitBreaker::new(BREAKER_NAME, BreakerSettings::from(&config.breaker));
        let journal = FailedRequestJournal::new(
            DataDir::new(config.base_path()).context("failed to open base directory")?,
            config.retry.max_attempts,
        );

        Ok(ResilientBackend::new(inner, breaker, Some(journal)))
    }

    fn get_base_path() -> Result<String> {
        if let Ok(base_path) = std::env::var("FOLIO_BASE_PATH") {
            return Ok(base_path);
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(format!("{}/.local/share/folio", home.to_string_lossy()))
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: String,
}
