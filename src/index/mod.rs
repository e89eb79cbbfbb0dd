//! Vector index capability.
//!
//! The index stores document ids and vectors, never document text; the
//! [`ContextStore`](crate::store::ContextStore) stays the source of truth.

mod memory;
mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::VectorIndexConfig;
use crate::error::{Error, Result};

/// Address value selecting the in-process index.
pub const MEMORY_INDEX_ADDRESS: &str = "memory";

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub doc_id: String,
    pub score: f32,
}

/// Similarity search over document vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector stored for `doc_id`.
    async fn upsert(&self, doc_id: &str, vector: &[f32]) -> Result<()>;

    /// Up to `top_k` nearest neighbours, best first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>>;

    /// Drop the vector stored for `doc_id`, if any.
    async fn remove(&self, doc_id: &str) -> Result<()>;
}

/// Connect the configured index; `None` when retrieval is disabled.
pub async fn connect(config: &VectorIndexConfig) -> Result<Option<Arc<dyn VectorIndex>>> {
    match config.address.as_deref() {
        None => {
            tracing::warn!("No vector index configured, retrieval disabled");
            Ok(None)
        }
        Some(MEMORY_INDEX_ADDRESS) => {
            tracing::info!("Using in-process vector index");
            Ok(Some(Arc::new(MemoryIndex::new())))
        }
        Some(address) => {
            let index = QdrantIndex::connect(address, config).await?;
            Ok(Some(Arc::new(index)))
        }
    }
}

/// Fail when the configured index dimension disagrees with the embedding
/// model's. The in-process index accepts any dimension; an unknown model
/// dimension is checked later, on the first embedding.
pub fn check_dimension(config: &VectorIndexConfig, embedding_dimension: Option<usize>) -> Result<()> {
    let (Some(address), Some(dimension)) = (config.address.as_deref(), embedding_dimension) else {
        return Ok(());
    };
    if address == MEMORY_INDEX_ADDRESS || config.dimension == dimension as u64 {
        return Ok(());
    }
    Err(Error::Config(format!(
        "vector_index.dimension is {} but the embedding model produces {}",
        config.dimension, dimension
    )))
}

/// Cosine similarity; 0.0 when either vector has zero norm or the
/// dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
