//! Node configuration.
//!
//! Loaded from a TOML file; every section has defaults so a partial file is
//! valid. CLI flags override the process-level inputs after loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retrieval::TieBreak;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub runner: RunnerConfig,
    pub vector_index: VectorIndexConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub request: RequestConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

/// Key-value store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("ragnode.db"),
        }
    }
}

/// LLM runner connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// `host:port` of the runner.
    pub address: String,
    pub model: String,
    /// Total connection attempts before giving up (first try included).
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub max_concurrent_sessions: usize,
    /// Capacity of the per-session token channel.
    pub token_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:11434".to_string(),
            model: "llama3.2".to_string(),
            connect_attempts: 4,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            inactivity_timeout_ms: 30_000,
            max_concurrent_sessions: 16,
            token_buffer: 64,
        }
    }
}

impl RunnerConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// Vector index settings. Retrieval is disabled when `address` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    pub address: Option<String>,
    pub collection: String,
    pub dimension: u64,
    pub timeout_secs: u64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            address: None,
            collection: "ragnode_documents".to_string(),
            dimension: 384,
            timeout_secs: 10,
        }
    }
}

/// Embedding backend settings. Exactly one of `local_model_path` and
/// `remote_url` must be resolvable; the local model wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub local_model_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    /// Model identifier for the remote service. Also part of the cache key.
    pub model: String,
    pub cache_capacity: u64,
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            local_model_path: None,
            remote_url: None,
            model: "all-minilm".to_string(),
            cache_capacity: 10_000,
            timeout_ms: 5_000,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retrieval defaults, overridable per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_score: f32,
    pub tie_break: TieBreak,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.5,
            tie_break: TieBreak::MostRecent,
        }
    }
}

/// Prompt assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Budget in characters of the rendered prompt.
    pub budget: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self { budget: 8_000 }
    }
}

/// Per-request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub default_max_tokens: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            default_max_tokens: 512,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// Embedding backend resolvability is not checked here; it is enforced
    /// when the resolver is built so that it can fail at startup.
    pub fn validate(&self) -> Result<()> {
        if self.runner.address.trim().is_empty() {
            return Err(Error::Config("runner.address must not be empty".to_string()));
        }
        if self.runner.connect_attempts == 0 {
            return Err(Error::Config(
                "runner.connect_attempts must be greater than 0".to_string(),
            ));
        }
        if self.runner.max_concurrent_sessions == 0 {
            return Err(Error::Config(
                "runner.max_concurrent_sessions must be greater than 0".to_string(),
            ));
        }
        if self.runner.token_buffer == 0 {
            return Err(Error::Config(
                "runner.token_buffer must be greater than 0".to_string(),
            ));
        }
        if self.runner.backoff_base_ms > self.runner.backoff_max_ms {
            return Err(Error::Config(
                "runner.backoff_base_ms must not exceed runner.backoff_max_ms".to_string(),
            ));
        }
        if self.embedding.cache_capacity == 0 {
            return Err(Error::Config(
                "embedding.cache_capacity must be greater than 0".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            return Err(Error::Config(
                "retrieval.min_score must be within [-1, 1]".to_string(),
            ));
        }
        if self.vector_index.address.is_some() && self.vector_index.dimension == 0 {
            return Err(Error::Config(
                "vector_index.dimension must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
