//! Retrieval coordination: vector index hits joined with stored documents.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::embedding::EmbeddingVector;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::store::{ContextStore, Document, Metadata};

/// How equal scores are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Most recently stored document first.
    #[default]
    MostRecent,
    /// Lexicographic document id.
    DocId,
}

/// A context snippet ready for prompt assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub doc_id: String,
    pub text: String,
    pub score: f32,
    pub metadata: Metadata,
    pub stored_at: u64,
}

/// Why an index hit did not make it into the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    BelowMinScore,
    /// The index points at a document the store no longer has.
    MissingDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedHit {
    pub doc_id: String,
    pub score: f32,
    pub reason: ExclusionReason,
}

/// Retrieval result with diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Retrieval {
    /// Kept chunks, best first.
    pub chunks: Vec<RetrievedChunk>,
    pub excluded: Vec<ExcludedHit>,
}

/// Queries the vector index and resolves hits through the store.
#[derive(Clone)]
pub struct RetrievalCoordinator {
    index: Option<Arc<dyn VectorIndex>>,
    store: ContextStore,
    tie_break: TieBreak,
}

impl RetrievalCoordinator {
    pub fn new(index: Option<Arc<dyn VectorIndex>>, store: ContextStore, tie_break: TieBreak) -> Self {
        Self {
            index,
            store,
            tie_break,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.index.is_some()
    }

    fn index(&self) -> Result<&Arc<dyn VectorIndex>> {
        self.index
            .as_ref()
            .ok_or_else(|| Error::RetrievalUnavailable("no vector index configured".to_string()))
    }

    /// Chunks scoring at least `min_score` among the `top_k` nearest
    /// neighbours, in descending score order.
    pub async fn retrieve(
        &self,
        vector: &EmbeddingVector,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        Ok(self
            .retrieve_with_diagnostics(vector, top_k, min_score)
            .await?
            .chunks)
    }

    /// Like [`retrieve`](Self::retrieve) but also reports the hits that were
    /// dropped and why.
    pub async fn retrieve_with_diagnostics(
        &self,
        vector: &EmbeddingVector,
        top_k: usize,
        min_score: f32,
    ) -> Result<Retrieval> {
        let index = self.index()?;
        if top_k == 0 {
            return Ok(Retrieval::default());
        }

        let hits = index
            .query(vector.as_slice(), top_k)
            .await
            .map_err(|e| match e {
                Error::RetrievalUnavailable(_) => e,
                other => Error::RetrievalUnavailable(other.to_string()),
            })?;

        let mut retrieval = Retrieval::default();
        for hit in hits.into_iter().take(top_k) {
            let document = match self.store.get(&hit.doc_id).await {
                Ok(document) => document,
                Err(Error::NotFound(_)) => {
                    tracing::debug!(doc_id = %hit.doc_id, "Index hit has no stored document, dropped");
                    retrieval.excluded.push(ExcludedHit {
                        doc_id: hit.doc_id,
                        score: hit.score,
                        reason: ExclusionReason::MissingDocument,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            retrieval.chunks.push(chunk(document, hit.score));
        }

        self.sort(&mut retrieval.chunks);

        // Cutoff applies after resolution so excluded hits stay inspectable.
        let (kept, below): (Vec<_>, Vec<_>) = retrieval
            .chunks
            .into_iter()
            .partition(|c| c.score >= min_score);
        retrieval.chunks = kept;
        retrieval.excluded.extend(below.into_iter().map(|c| ExcludedHit {
            doc_id: c.doc_id,
            score: c.score,
            reason: ExclusionReason::BelowMinScore,
        }));

        Ok(retrieval)
    }

    fn sort(&self, chunks: &mut [RetrievedChunk]) {
        let tie_break = self.tie_break;
        chunks.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| match tie_break {
                    TieBreak::MostRecent => b.stored_at.cmp(&a.stored_at),
                    TieBreak::DocId => Ordering::Equal,
                })
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
    }

    /// Index a stored document under its id.
    pub async fn index_document(&self, document: &Document, vector: &EmbeddingVector) -> Result<()> {
        self.index()?.upsert(&document.id, vector.as_slice()).await
    }

    /// Remove a document's vector from the index.
    pub async fn unindex_document(&self, doc_id: &str) -> Result<()> {
        self.index()?.remove(doc_id).await
    }
}

fn chunk(document: Document, score: f32) -> RetrievedChunk {
    RetrievedChunk {
        doc_id: document.id,
        text: document.text,
        score,
        metadata: document.metadata,
        stored_at: document.stored_at,
    }
}
