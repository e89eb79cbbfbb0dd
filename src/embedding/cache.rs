use moka::future::Cache;
use moka::policy::EvictionPolicy;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use super::EmbeddingVector;
use crate::error::{Error, Result};

/// Cache key: SHA-256 of the source text plus the model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: Arc<str>,
    digest: [u8; 32],
}

impl CacheKey {
    pub fn new(model: &str, text: &str) -> Self {
        Self {
            model: Arc::from(model),
            digest: Sha256::digest(text.as_bytes()).into(),
        }
    }
}

/// A cached embedding with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub vector: EmbeddingVector,
    pub inserted_at: Instant,
}

/// Bounded, thread-safe embedding cache with least-recently-used eviction.
///
/// Reads of distinct keys do not contend on a single lock, and
/// [`get_or_try_insert`](Self::get_or_try_insert) is atomic: concurrent
/// misses on one key run the loader once and share its result.
#[derive(Clone)]
pub struct EmbeddingCache {
    inner: Cache<CacheKey, CacheEntry>,
}

impl EmbeddingCache {
    pub fn new(capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { inner }
    }

    /// Look up `key`, running `load` on a miss. Returns the vector and
    /// whether it was served from the cache. Failed loads are not cached.
    pub async fn get_or_try_insert<F>(&self, key: CacheKey, load: F) -> Result<(EmbeddingVector, bool)>
    where
        F: Future<Output = Result<EmbeddingVector>>,
    {
        let entry = self
            .inner
            .entry(key)
            .or_try_insert_with(async {
                load.await.map(|vector| CacheEntry {
                    vector,
                    inserted_at: Instant::now(),
                })
            })
            .await
            .map_err(|shared: Arc<Error>| unshare(&shared))?;

        let hit = !entry.is_fresh();
        Ok((entry.into_value().vector, hit))
    }

    /// Cached vector for `key`, if present.
    pub async fn get(&self, key: &CacheKey) -> Option<EmbeddingVector> {
        self.inner.get(key).await.map(|entry| entry.vector)
    }

    /// Number of cached entries after pending maintenance has run.
    pub async fn len(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Rebuild an owned error from one shared between coalesced loaders,
/// keeping its kind.
fn unshare(err: &Error) -> Error {
    match err {
        Error::EmbeddingTimeout(ms) => Error::EmbeddingTimeout(*ms),
        other => Error::EmbeddingUnavailable(other.to_string()),
    }
}
