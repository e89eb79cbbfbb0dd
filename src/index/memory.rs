use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{cosine_similarity, IndexHit, VectorIndex};
use crate::error::Result;

/// Brute-force in-process index for single-node deployments.
///
/// Not durable: the orchestrator rebuilds it from the store on startup.
#[derive(Default)]
pub struct MemoryIndex {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, doc_id: &str, vector: &[f32]) -> Result<()> {
        self.vectors
            .write()
            .await
            .insert(doc_id.to_string(), vector.to_vec());
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        let vectors = self.vectors.read().await;
        let mut hits: Vec<IndexHit> = vectors
            .iter()
            .map(|(doc_id, stored)| IndexHit {
                doc_id: doc_id.clone(),
                score: cosine_similarity(vector, stored),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn remove(&self, doc_id: &str) -> Result<()> {
        self.vectors.write().await.remove(doc_id);
        Ok(())
    }
}
