//! In-crate test doubles for the external capabilities.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::embedding::EmbeddingBackend;
use crate::error::{Error, Result};
use crate::index::{IndexHit, VectorIndex};
use crate::inference::{GenerationRequest, LlmRunner, RunnerConnection, RunnerError};
use crate::store::KeyValueStore;

/// Ordered in-memory key-value store with injectable failures.
#[derive(Default)]
pub(crate) struct MemoryKv {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    failure: Mutex<Option<String>>,
}

impl MemoryKv {
    /// Make the next call fail as if the engine were down.
    pub(crate) fn fail_next(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().unwrap().take() {
            Some(reason) => Err(Error::StoreUnavailable(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check()?;
        self.entries.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check()?;
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Deterministic embedder that counts backend calls.
///
/// Texts mentioning "France" or "Paris" embed close to each other so
/// end-to-end tests get a meaningful nearest neighbour.
pub(crate) struct CountingEmbedder {
    dimension: usize,
    calls: AtomicUsize,
    delay: Option<Duration>,
    overrides: HashMap<String, usize>,
    failing: bool,
}

impl CountingEmbedder {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
            delay: None,
            overrides: HashMap::new(),
            failing: false,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Produce vectors of a different dimension for one text.
    pub(crate) fn with_dimension_for(mut self, text: &str, dimension: usize) -> Self {
        self.overrides.insert(text.to_string(), dimension);
        self
    }

    /// Every call fails as unavailable.
    pub(crate) fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let dimension = self.overrides.get(text).copied().unwrap_or(self.dimension);
        let mut values = vec![0.0f32; dimension];
        let lower = text.to_lowercase();
        if lower.contains("france") || lower.contains("paris") {
            values[0] = 1.0;
        }
        for (i, byte) in text.bytes().enumerate() {
            let slot = 1 + (i + byte as usize) % (dimension - 1).max(1);
            values[slot.min(dimension - 1)] += byte as f32 / 25500.0;
        }
        values
    }
}

#[async_trait]
impl EmbeddingBackend for CountingEmbedder {
    fn model_id(&self) -> &str {
        "counting"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing {
            return Err(Error::EmbeddingUnavailable("embedding host down".to_string()));
        }
        Ok(self.vector(text))
    }
}

/// Index returning a fixed hit list regardless of the query vector.
#[derive(Clone)]
pub(crate) struct FixedIndex {
    hits: Vec<IndexHit>,
}

impl FixedIndex {
    pub(crate) fn new(hits: Vec<(&str, f32)>) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|(doc_id, score)| IndexHit {
                    doc_id: doc_id.to_string(),
                    score,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl VectorIndex for FixedIndex {
    async fn upsert(&self, _doc_id: &str, _vector: &[f32]) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        let mut hits = self.hits.clone();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn remove(&self, _doc_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Index whose service is unreachable.
pub(crate) struct FailingIndex;

#[async_trait]
impl VectorIndex for FailingIndex {
    async fn upsert(&self, _doc_id: &str, _vector: &[f32]) -> Result<()> {
        Err(Error::RetrievalUnavailable("connection refused".to_string()))
    }

    async fn query(&self, _vector: &[f32], _top_k: usize) -> Result<Vec<IndexHit>> {
        Err(Error::RetrievalUnavailable("connection refused".to_string()))
    }

    async fn remove(&self, _doc_id: &str) -> Result<()> {
        Err(Error::RetrievalUnavailable("connection refused".to_string()))
    }
}

/// Runner replaying a token script, with scripted connection behaviour.
pub(crate) struct ScriptedRunner {
    tokens: Vec<String>,
    refuse_first: usize,
    protocol_error: Option<String>,
    stall_after: Option<usize>,
    hang_on_connect: bool,
    token_delay: Option<Duration>,
    attempts: AtomicUsize,
    closed: Arc<AtomicUsize>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub(crate) fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            refuse_first: 0,
            protocol_error: None,
            stall_after: None,
            hang_on_connect: false,
            token_delay: None,
            attempts: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Refuse the first `n` connection attempts.
    pub(crate) fn refuse_first(mut self, n: usize) -> Self {
        self.refuse_first = n;
        self
    }

    /// Answer every connection with a protocol failure.
    pub(crate) fn reject_protocol(mut self, message: &str) -> Self {
        self.protocol_error = Some(message.to_string());
        self
    }

    /// Go silent after emitting `n` tokens.
    pub(crate) fn stall_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }

    /// Accept connections but never answer them.
    pub(crate) fn hang_on_connect(mut self) -> Self {
        self.hang_on_connect = true;
        self
    }

    pub(crate) fn token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connections that were opened and have since been dropped.
    pub(crate) fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Prompts of accepted connections, in order.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmRunner for ScriptedRunner {
    async fn connect(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<Box<dyn RunnerConnection>, RunnerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refuse_first {
            return Err(RunnerError::Connect("connection refused".to_string()));
        }
        if let Some(message) = &self.protocol_error {
            return Err(RunnerError::Protocol(message.clone()));
        }
        if self.hang_on_connect {
            std::future::pending::<()>().await;
        }
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(Box::new(ScriptedConnection {
            tokens: self.tokens.iter().cloned().collect(),
            emitted: 0,
            stall_after: self.stall_after,
            token_delay: self.token_delay,
            closed: self.closed.clone(),
        }))
    }
}

struct ScriptedConnection {
    tokens: VecDeque<String>,
    emitted: usize,
    stall_after: Option<usize>,
    token_delay: Option<Duration>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl RunnerConnection for ScriptedConnection {
    async fn next_token(&mut self) -> std::result::Result<Option<String>, RunnerError> {
        if self.stall_after == Some(self.emitted) {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.token_delay {
            tokio::time::sleep(delay).await;
        }
        let token = self.tokens.pop_front();
        if token.is_some() {
            self.emitted += 1;
        }
        Ok(token)
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
