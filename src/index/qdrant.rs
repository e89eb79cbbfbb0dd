use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, CreateCollectionBuilder, DeletePointsBuilder, Distance, PointId, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{IndexHit, VectorIndex};
use crate::config::VectorIndexConfig;
use crate::error::{Error, Result};

/// Payload field carrying the original document id.
const DOC_ID_FIELD: &str = "doc_id";

/// Qdrant-backed [`VectorIndex`] using cosine distance.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
}

impl QdrantIndex {
    /// Connect and make sure the collection exists.
    pub async fn connect(url: &str, config: &VectorIndexConfig) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::RetrievalUnavailable(format!("failed to build client: {}", e)))?;

        let index = Self {
            client,
            collection: config.collection.clone(),
        };
        index.ensure_collection(config.dimension).await?;
        tracing::info!("Connected to Qdrant at {} (collection {})", url, index.collection);
        Ok(index)
    }

    async fn ensure_collection(&self, dimension: u64) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(dimension, Distance::Cosine)),
            )
            .await?;
        tracing::info!("Created collection {} (dim {})", self.collection, dimension);
        Ok(())
    }

    /// Qdrant only accepts UUIDs or integers as point ids; derive a stable
    /// UUID from the document id.
    fn point_id(doc_id: &str) -> PointId {
        PointId::from(Uuid::new_v5(&Uuid::NAMESPACE_OID, doc_id.as_bytes()).to_string())
    }

    /// The payload holds only the document id; text and metadata stay in
    /// the store.
    fn payload(doc_id: &str) -> HashMap<String, QdrantValue> {
        HashMap::from([(DOC_ID_FIELD.to_string(), QdrantValue::from(doc_id.to_string()))])
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, doc_id: &str, vector: &[f32]) -> Result<()> {
        let point = PointStruct::new(Self::point_id(doc_id), vector.to_vec(), Self::payload(doc_id));
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let doc_id = match point.payload.get(DOC_ID_FIELD).and_then(|v| v.kind.as_ref()) {
                    Some(Kind::StringValue(id)) => id.clone(),
                    _ => {
                        tracing::warn!("Qdrant point without {} payload skipped", DOC_ID_FIELD);
                        return None;
                    }
                };
                Some(IndexHit {
                    doc_id,
                    score: point.score,
                })
            })
            .collect())
    }

    async fn remove(&self, doc_id: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(vec![Self::point_id(doc_id)])
                    .wait(true),
            )
            .await?;
        Ok(())
    }
}
