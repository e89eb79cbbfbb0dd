use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::{
    CacheKey, EmbeddingBackend, EmbeddingCache, EmbeddingVector, LocalEmbedder, RemoteEmbedder,
};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Resolves text to embeddings through a shared cache.
///
/// One resolver serves one model. The output dimension is taken from the
/// backend when it declares one, otherwise pinned by the first successful
/// embedding; vectors of any other dimension are rejected before they reach
/// the cache.
#[derive(Clone)]
pub struct EmbeddingResolver {
    backend: Arc<dyn EmbeddingBackend>,
    cache: EmbeddingCache,
    timeout: Duration,
    dimension: Arc<OnceLock<usize>>,
}

impl EmbeddingResolver {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, cache_capacity: u64, timeout: Duration) -> Self {
        let dimension = OnceLock::new();
        if let Some(dim) = backend.dimension() {
            let _ = dimension.set(dim);
        }
        Self {
            backend,
            cache: EmbeddingCache::new(cache_capacity),
            timeout,
            dimension: Arc::new(dimension),
        }
    }

    /// Build the resolver from configuration.
    ///
    /// Prefers the local model when both backends are configured and fails
    /// with [`Error::EmbeddingUnavailable`] when neither is.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let backend: Arc<dyn EmbeddingBackend> = match (&config.local_model_path, &config.remote_url) {
            (Some(path), _) => Arc::new(LocalEmbedder::load(path)?),
            (None, Some(url)) => {
                tracing::info!("Using remote embedding service at {}", url);
                Arc::new(RemoteEmbedder::new(url.clone(), config.model.clone(), config.timeout())?)
            }
            (None, None) => {
                return Err(Error::EmbeddingUnavailable(
                    "neither embedding.local_model_path nor embedding.remote_url is configured"
                        .to_string(),
                ))
            }
        };
        Ok(Self::new(backend, config.cache_capacity, config.timeout()))
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    /// Dimension of this resolver's vectors, once known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    /// Embedding for `text`, from the cache when possible.
    ///
    /// A `model_hint` naming a different model than the configured backend is
    /// rejected.
    pub async fn resolve(&self, text: &str, model_hint: Option<&str>) -> Result<EmbeddingVector> {
        if let Some(hint) = model_hint {
            if hint != self.backend.model_id() {
                return Err(Error::EmbeddingUnavailable(format!(
                    "model '{}' is not configured (serving '{}')",
                    hint,
                    self.backend.model_id()
                )));
            }
        }

        let key = CacheKey::new(self.backend.model_id(), text);
        let (vector, hit) = self.cache.get_or_try_insert(key, self.load(text)).await?;

        if hit {
            metrics::counter!("ragnode_embedding_cache_hits_total").increment(1);
        } else {
            metrics::counter!("ragnode_embedding_cache_misses_total").increment(1);
            tracing::debug!(dimension = vector.dimension(), "Embedding computed");
        }
        Ok(vector)
    }

    async fn load(&self, text: &str) -> Result<EmbeddingVector> {
        let values = tokio::time::timeout(self.timeout, self.backend.embed(text))
            .await
            .map_err(|_| Error::EmbeddingTimeout(self.timeout.as_millis() as u64))??;

        let expected = *self.dimension.get_or_init(|| values.len());
        if values.len() != expected {
            return Err(Error::EmbeddingUnavailable(format!(
                "dimension mismatch: expected {}, got {}",
                expected,
                values.len()
            )));
        }
        Ok(EmbeddingVector::new(values))
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}
