use std::time::Duration;

use crate::semantic::{EngineError, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("search engine unavailable: circuit open")]
    CircuitOpen,

    #[error("search engine call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("failed request journal: {0}")]
    Journal(#[from] super::failed::JournalError),

    #[error("reqwest error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the error says something about the engine's health.
    ///
    /// Missing and duplicate indexes are answers, not outages, and do not
    /// count against the circuit breaker.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AppError::NotFound(_) | AppError::AlreadyExists(_))
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(e @ StoreError::NotFound(_)) => AppError::NotFound(e.to_string()),
            EngineError::Store(e @ StoreError::AlreadyExists(_)) => {
                AppError::AlreadyExists(e.to_string())
            }
            other => AppError::Engine(other),
        }
    }
}
