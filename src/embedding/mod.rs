//! Embedding acquisition.
//!
//! ```text
//! text ──▶ EmbeddingResolver ──▶ EmbeddingCache (moka, LRU)
//!                │ miss
//!                ▼
//!        EmbeddingBackend
//!        ├── LocalEmbedder  (fastembed, in-process)
//!        └── RemoteEmbedder (HTTP embedding service)
//! ```

mod backend;
mod cache;
mod resolver;

pub use backend::{EmbeddingBackend, LocalEmbedder, RemoteEmbedder};
pub use cache::{CacheKey, EmbeddingCache};
pub use resolver::EmbeddingResolver;

use std::sync::Arc;

/// Dimension of the bundled local model (all-MiniLM-L6-v2).
pub const LOCAL_MODEL_DIM: usize = 384;

/// A fixed-dimension embedding.
///
/// Cheap to clone; the components are shared between the cache and every
/// request that resolved the same text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    values: Arc<[f32]>,
}

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.to_vec()
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}
