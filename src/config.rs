use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{semantic, storage::DataDir};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_LOAD_WORKERS: usize = 8;
const DEFAULT_CONTAINER_ROOT: &str = "/app";
const DEFAULT_LISTEN: &str = "0.0.0.0:5000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config file is not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Circuit breaker settings for calls into the search engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure ratio in (0, 1] over the window that opens the circuit
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f32,

    /// Number of most recent calls considered
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Calls required in the window before the ratio is evaluated
    #[serde(default = "default_window_size")]
    pub minimum_calls: usize,

    #[serde(default = "default_open_cooldown_secs")]
    pub open_cooldown_secs: u64,

    /// Trial calls let through while half-open
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            window_size: default_window_size(),
            minimum_calls: default_window_size(),
            open_cooldown_secs: default_open_cooldown_secs(),
            half_open_trials: default_half_open_trials(),
        }
    }
}

fn default_failure_rate_threshold() -> f32 {
    0.5
}

fn default_window_size() -> usize {
    10
}

fn default_open_cooldown_secs() -> u64 {
    60
}

fn default_half_open_trials() -> usize {
    3
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Embedding model name (e.g. "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Expected embedding dimensions; index files record it
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Images per inference batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent file loaders during ingestion
    #[serde(default = "default_load_workers")]
    pub load_workers: usize,

    /// Search the named collections concurrently
    #[serde(default)]
    pub parallel_search: bool,

    /// Index directory; defaults to `<root>/data/indexes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_dir: Option<PathBuf>,

    /// Root used when `<container_root>/data/uploads` exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_root: Option<PathBuf>,

    /// Root used otherwise; defaults to the base directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,

    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upper bound for one engine call, on both sides of the HTTP API
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            load_workers: default_load_workers(),
            parallel_search: false,
            index_dir: None,
            container_root: None,
            local_root: None,
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            base_path: String::new(),
        }
    }
}

fn default_model() -> String {
    semantic::DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    semantic::DEFAULT_DIMENSIONS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_load_workers() -> usize {
    DEFAULT_LOAD_WORKERS
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.dimensions == 0 {
            return invalid("dimensions must be greater than 0".into());
        }
        if self.dimensions > u16::MAX as usize {
            return invalid(format!("dimensions must be at most {}", u16::MAX));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than 0".into());
        }
        if self.load_workers == 0 {
            return invalid("load_workers must be greater than 0".into());
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be greater than 0".into());
        }

        let breaker = &self.breaker;
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return invalid(format!(
                "breaker.failure_rate_threshold must be in (0, 1], got {}",
                breaker.failure_rate_threshold
            ));
        }
        if breaker.window_size == 0 {
            return invalid("breaker.window_size must be greater than 0".into());
        }
        if breaker.minimum_calls == 0 || breaker.minimum_calls > breaker.window_size {
            return invalid(format!(
                "breaker.minimum_calls must be between 1 and window_size ({}), got {}",
                breaker.window_size, breaker.minimum_calls
            ));
        }
        if breaker.half_open_trials == 0 {
            return invalid("breaker.half_open_trials must be greater than 0".into());
        }

        Ok(())
    }

    /// Read `config.yaml` from `base_path`, writing defaults first if it is missing.
    pub fn load_with(base_path: &str) -> Result<Self, ConfigError> {
        let dir = DataDir::new(base_path)?;

        if !dir.exists(CONFIG_FILE) {
            dir.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(dir.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = DataDir::new(&self.base_path)?;
        dir.write(CONFIG_FILE, serde_yml::to_string(&self)?.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn container_root(&self) -> PathBuf {
        self.container_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTAINER_ROOT))
    }

    pub fn local_root(&self) -> PathBuf {
        self.local_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.base_path))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
