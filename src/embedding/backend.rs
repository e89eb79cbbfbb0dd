use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::LOCAL_MODEL_DIM;
use crate::error::{Error, Result};

/// Text-to-vector capability.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Identifier of the model; part of every cache key.
    fn model_id(&self) -> &str;

    /// Output dimension when known up front.
    fn dimension(&self) -> Option<usize> {
        None
    }

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// In-process embedding model (fastembed, ONNX based).
///
/// Inference is CPU bound and runs on the blocking pool.
pub struct LocalEmbedder {
    model: Arc<Mutex<fastembed::TextEmbedding>>,
    model_id: String,
}

impl LocalEmbedder {
    /// Load all-MiniLM-L6-v2 with model artifacts under `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
            .with_cache_dir(model_dir.to_path_buf())
            .with_show_download_progress(false);

        let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
            Error::EmbeddingUnavailable(format!(
                "failed to load local model from {}: {}",
                model_dir.display(),
                e
            ))
        })?;

        tracing::info!("Loaded local embedding model from {}", model_dir.display());
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_id: "fastembed/all-MiniLM-L6-v2".to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        Some(LOCAL_MODEL_DIM)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.model.clone();
        let text = text.to_string();
        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| Error::EmbeddingUnavailable("local model lock poisoned".to_string()))?;
            model
                .embed(vec![text], None)
                .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))
        })
        .await
        .map_err(|e| Error::EmbeddingUnavailable(format!("embedding task failed: {}", e)))??;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingUnavailable("model returned no embedding".to_string()))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Remote embedding service speaking the Ollama `/api/embeddings` shape.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl RemoteEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build embedding client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for RemoteEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::EmbeddingUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingUnavailable(format!(
                "embedding service error ({}): {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingUnavailable(format!("bad embedding response: {}", e)))?;
        if parsed.embedding.is_empty() {
            return Err(Error::EmbeddingUnavailable(
                "embedding service returned an empty vector".to_string(),
            ));
        }
        Ok(parsed.embedding)
    }
}
