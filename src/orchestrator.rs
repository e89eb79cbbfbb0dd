//! Per-query request orchestration.
//!
//! ```text
//! Query ─▶ embed ─▶ retrieve ─▶ assemble ─▶ dispatch ─▶ TokenStream
//!           │          │
//!           └─ Degraded ┴─▶ empty context (fail-open)
//! ```
//!
//! One deadline spans every stage. Embedding and retrieval failures degrade
//! the request to an uncontextualised prompt; only inference failures,
//! the deadline and cancellation end it.

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::config::Config;
use crate::embedding::{EmbeddingResolver, EmbeddingVector};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::inference::{
    Deadline, DispatcherSettings, GenerationRequest, InferenceDispatcher, LlmRunner, SessionHandle,
    TokenStream,
};
use crate::prompt::{self, AssembledPrompt};
use crate::retrieval::{Retrieval, RetrievalCoordinator, RetrievedChunk};
use crate::store::{ContextStore, Document, Metadata};

/// An incoming question with optional per-request overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    text: String,
    request_id: String,
    top_k: Option<usize>,
    min_score: Option<f32>,
    max_tokens: Option<u32>,
}

impl Query {
    /// A query with a fresh request id.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            top_k: None,
            min_score: None,
            max_tokens: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Result of one orchestration stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    /// The stage failed but the request continues without its output.
    Degraded(Error),
    /// The request ends.
    Fatal(Error),
}

impl<T> StageOutcome<T> {
    /// Classify the result of a fail-open stage. Deadline and cancellation
    /// stay fatal; every other failure degrades.
    pub fn fail_open(result: Result<T>) -> Self {
        match result {
            Ok(value) => StageOutcome::Ok(value),
            Err(e @ (Error::Cancelled | Error::RequestTimeout(_))) => StageOutcome::Fatal(e),
            Err(e) => StageOutcome::Degraded(e),
        }
    }
}

/// Request defaults, overridable per query.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub top_k: usize,
    pub min_score: f32,
    pub prompt_budget: usize,
    pub default_max_tokens: u32,
    pub request_timeout: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            min_score: config.retrieval.min_score,
            prompt_budget: config.prompt.budget,
            default_max_tokens: config.request.default_max_tokens,
            request_timeout: config.request.timeout(),
        }
    }
}

/// Sequences embedding, retrieval, prompt assembly and inference for each
/// query, and owns document ingestion.
#[derive(Clone)]
pub struct Orchestrator {
    resolver: EmbeddingResolver,
    retrieval: RetrievalCoordinator,
    store: ContextStore,
    dispatcher: InferenceDispatcher,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        resolver: EmbeddingResolver,
        store: ContextStore,
        index: Option<Arc<dyn VectorIndex>>,
        runner: Arc<dyn LlmRunner>,
        config: &Config,
    ) -> Self {
        Self {
            resolver,
            retrieval: RetrievalCoordinator::new(index, store.clone(), config.retrieval.tie_break),
            store,
            dispatcher: InferenceDispatcher::new(runner, DispatcherSettings::from(&config.runner)),
            settings: OrchestratorSettings::from(config),
        }
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn retrieval_enabled(&self) -> bool {
        self.retrieval.is_enabled()
    }

    /// Answer `query` as a token stream.
    ///
    /// Returns immediately; stages run in a background task. Dropping or
    /// cancelling the stream stops the request.
    pub fn handle(&self, query: Query) -> TokenStream {
        let (stream, session) = TokenStream::channel(self.dispatcher.token_buffer());
        let span = tracing::info_span!("request", request_id = %query.request_id);
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run(query, session).await }.instrument(span));
        stream
    }

    async fn run(&self, query: Query, mut session: SessionHandle) {
        metrics::counter!("ragnode_requests_total").increment(1);
        let deadline = Deadline::after(self.settings.request_timeout);
        tracing::info!("Handling query ({} chars)", query.text.chars().count());

        let chunks = match self.context(&query, &deadline, &mut session).await {
            StageOutcome::Ok(chunks) => chunks,
            StageOutcome::Degraded(reason) => {
                metrics::counter!("ragnode_stage_degraded_total").increment(1);
                tracing::warn!(
                    kind = reason.kind().as_str(),
                    "Continuing without context: {}",
                    reason
                );
                Vec::new()
            }
            StageOutcome::Fatal(e) => {
                session.finish(Err(e)).await;
                return;
            }
        };

        let prompt = self.assemble(&query, &chunks);
        let request = GenerationRequest {
            prompt: prompt.render(),
            max_tokens: query.max_tokens.unwrap_or(self.settings.default_max_tokens),
        };
        self.dispatcher.run(request, deadline, session).await;
    }

    /// Embedding followed by retrieval; either failing degrades the request.
    async fn context(
        &self,
        query: &Query,
        deadline: &Deadline,
        session: &mut SessionHandle,
    ) -> StageOutcome<Vec<RetrievedChunk>> {
        let vector = match self.embed(query, deadline, session).await {
            StageOutcome::Ok(vector) => vector,
            StageOutcome::Degraded(e) => return StageOutcome::Degraded(e),
            StageOutcome::Fatal(e) => return StageOutcome::Fatal(e),
        };
        self.retrieve(query, &vector, deadline, session).await
    }

    async fn embed(
        &self,
        query: &Query,
        deadline: &Deadline,
        session: &mut SessionHandle,
    ) -> StageOutcome<EmbeddingVector> {
        match session
            .guarded(deadline, self.resolver.resolve(&query.text, None))
            .await
        {
            Ok(result) => StageOutcome::fail_open(result),
            Err(e) => StageOutcome::Fatal(e),
        }
    }

    async fn retrieve(
        &self,
        query: &Query,
        vector: &EmbeddingVector,
        deadline: &Deadline,
        session: &mut SessionHandle,
    ) -> StageOutcome<Vec<RetrievedChunk>> {
        let top_k = query.top_k.unwrap_or(self.settings.top_k);
        let min_score = query.min_score.unwrap_or(self.settings.min_score);
        let retrieval = self.retrieval.retrieve_with_diagnostics(vector, top_k, min_score);

        match session.guarded(deadline, retrieval).await {
            Ok(Ok(retrieval)) => {
                tracing::debug!(
                    kept = retrieval.chunks.len(),
                    excluded = retrieval.excluded.len(),
                    "Retrieved context"
                );
                StageOutcome::Ok(retrieval.chunks)
            }
            Ok(Err(e)) => StageOutcome::fail_open(Err(e)),
            Err(e) => StageOutcome::Fatal(e),
        }
    }

    /// Retrieval only: the chunks `query` would get as context, and the hits
    /// that were dropped. Unlike [`handle`](Self::handle) nothing fails open;
    /// embedding and index failures are returned.
    pub async fn search(&self, query: &Query) -> Result<Retrieval> {
        let deadline = Deadline::after(self.settings.request_timeout);
        let top_k = query.top_k.unwrap_or(self.settings.top_k);
        let min_score = query.min_score.unwrap_or(self.settings.min_score);

        let search = async {
            let vector = self.resolver.resolve(&query.text, None).await?;
            self.retrieval
                .retrieve_with_diagnostics(&vector, top_k, min_score)
                .await
        };
        let retrieval = tokio::time::timeout_at(deadline.at(), search)
            .await
            .map_err(|_| deadline.error())??;

        tracing::debug!(
            request_id = %query.request_id,
            kept = retrieval.chunks.len(),
            excluded = retrieval.excluded.len(),
            "Search"
        );
        Ok(retrieval)
    }

    fn assemble(&self, query: &Query, chunks: &[RetrievedChunk]) -> AssembledPrompt {
        let prompt = prompt::assemble(&query.text, chunks, self.settings.prompt_budget);
        tracing::debug!(
            context = ?prompt.context_ids(),
            size = prompt.size(),
            template_version = prompt.template_version(),
            "Prompt assembled"
        );
        prompt
    }

    /// Store a document and index it for retrieval.
    ///
    /// The store write happens first and is kept even when embedding or
    /// indexing fails; the error is returned so the caller can retry.
    pub async fn ingest(&self, doc_id: &str, text: &str, metadata: Metadata) -> Result<Document> {
        if doc_id.is_empty() {
            return Err(Error::InvalidRequest("document id must not be empty".to_string()));
        }
        let document = self.store.put(doc_id, text, metadata).await?;
        if !self.retrieval.is_enabled() {
            tracing::debug!(doc_id, "Stored document; no vector index to update");
            return Ok(document);
        }
        let vector = self.resolver.resolve(text, None).await?;
        self.retrieval.index_document(&document, &vector).await?;
        tracing::info!(doc_id, "Ingested document");
        Ok(document)
    }

    pub async fn get_document(&self, doc_id: &str) -> Result<Document> {
        self.store.get(doc_id).await
    }

    /// Ids of every stored document, in order.
    pub async fn list_documents(&self) -> Result<Vec<String>> {
        self.store.list_ids().await
    }

    /// Delete a document. A failure to drop its index entry is only logged;
    /// retrieval skips ids the store no longer has.
    pub async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.store.delete(doc_id).await?;
        if self.retrieval.is_enabled() {
            if let Err(e) = self.retrieval.unindex_document(doc_id).await {
                tracing::warn!(doc_id, "Index entry left behind: {}", e);
            }
        }
        tracing::info!(doc_id, "Deleted document");
        Ok(())
    }

    /// Re-embed and re-index every stored document. Returns how many were
    /// indexed.
    pub async fn reindex(&self) -> Result<usize> {
        if !self.retrieval.is_enabled() {
            return Ok(0);
        }
        let mut indexed = 0;
        for doc_id in self.store.list_ids().await? {
            let document = match self.store.get(&doc_id).await {
                Ok(document) => document,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let vector = self.resolver.resolve(&document.text, None).await?;
            self.retrieval.index_document(&document, &vector).await?;
            indexed += 1;
        }
        tracing::info!("Reindexed {} documents", indexed);
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::index::MemoryIndex;
    use crate::inference::SessionState;
    use crate::retrieval::ExclusionReason;
    use crate::testing::{CountingEmbedder, FailingIndex, MemoryKv, ScriptedRunner};
    use futures::StreamExt;

    const QUESTION: &str = "What is the capital of France?";
    const ANSWER: [&str; 4] = ["Paris", " is", " the", " capital"];

    struct Harness {
        orchestrator: Orchestrator,
        kv: Arc<MemoryKv>,
        embedder: Arc<CountingEmbedder>,
        runner: Arc<ScriptedRunner>,
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.retrieval.top_k = 3;
        config.retrieval.min_score = 0.5;
        config.runner.connect_attempts = 3;
        config.runner.backoff_base_ms = 50;
        config.runner.backoff_max_ms = 200;
        config.runner.inactivity_timeout_ms = 1_000;
        config.request.timeout_ms = 10_000;
        config
    }

    fn harness_with(
        embedder: CountingEmbedder,
        index: Option<Arc<dyn VectorIndex>>,
        runner: ScriptedRunner,
        config: &Config,
    ) -> Harness {
        let embedder = Arc::new(embedder);
        let runner = Arc::new(runner);
        let resolver = EmbeddingResolver::new(embedder.clone(), 64, Duration::from_secs(1));
        let kv = Arc::new(MemoryKv::default());
        let store = ContextStore::new(kv.clone());
        let orchestrator = Orchestrator::new(resolver, store, index, runner.clone(), config);
        Harness {
            orchestrator,
            kv,
            embedder,
            runner,
        }
    }

    fn harness(runner: ScriptedRunner) -> Harness {
        harness_with(
            CountingEmbedder::new(8),
            Some(Arc::new(MemoryIndex::new())),
            runner,
            &config(),
        )
    }

    async fn collect(mut stream: TokenStream) -> (String, Option<Error>) {
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => text.push_str(&chunk.text),
                Err(e) => return (text, Some(e)),
            }
        }
        (text, None)
    }

    #[tokio::test]
    async fn test_answers_with_retrieved_context() {
        let h = harness(ScriptedRunner::new(ANSWER));
        h.orchestrator
            .ingest("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap();
        h.orchestrator
            .ingest("d2", "Bananas are rich in potassium", Metadata::new())
            .await
            .unwrap();

        let stream = h.orchestrator.handle(Query::new(QUESTION));
        let mut state = stream.state_watch();
        let (text, err) = collect(stream).await;

        assert!(err.is_none());
        assert_eq!(text, "Paris is the capital");
        assert_eq!(
            h.runner.prompts(),
            vec![format!(
                "[context:d1]\nParis is the capital of France\n\n[question]\n{}\n",
                QUESTION
            )]
        );
        assert_eq!(
            *state.wait_for(|s| s.is_terminal()).await.unwrap(),
            SessionState::Completed
        );
    }

    #[tokio::test]
    async fn test_unreachable_index_still_answers() {
        let h = harness_with(
            CountingEmbedder::new(8),
            Some(Arc::new(FailingIndex)),
            ScriptedRunner::new(ANSWER),
            &config(),
        );

        let (text, err) = collect(h.orchestrator.handle(Query::new(QUESTION))).await;

        assert!(err.is_none());
        assert_eq!(text, "Paris is the capital");
        assert_eq!(h.runner.prompts(), vec![format!("[question]\n{}\n", QUESTION)]);
    }

    #[tokio::test]
    async fn test_unconfigured_index_still_answers() {
        let h = harness_with(CountingEmbedder::new(8), None, ScriptedRunner::new(ANSWER), &config());
        assert!(!h.orchestrator.retrieval_enabled());

        let (text, err) = collect(h.orchestrator.handle(Query::new(QUESTION))).await;
        assert!(err.is_none());
        assert_eq!(text, "Paris is the capital");
        assert_eq!(h.runner.prompts(), vec![format!("[question]\n{}\n", QUESTION)]);
    }

    #[tokio::test]
    async fn test_embedding_failure_still_answers() {
        let h = harness_with(
            CountingEmbedder::new(8).failing(),
            Some(Arc::new(MemoryIndex::new())),
            ScriptedRunner::new(ANSWER),
            &config(),
        );

        let (text, err) = collect(h.orchestrator.handle(Query::new(QUESTION))).await;
        assert!(err.is_none());
        assert_eq!(text, "Paris is the capital");
        assert_eq!(h.embedder.calls(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_during_retrieval_still_answers() {
        let h = harness(ScriptedRunner::new(ANSWER));
        h.orchestrator
            .ingest("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap();
        h.kv.fail_next("disk I/O error");

        let stream = h.orchestrator.handle(Query::new(QUESTION));
        let mut state = stream.state_watch();
        let (text, err) = collect(stream).await;

        assert!(err.is_none());
        assert_eq!(text, "Paris is the capital");
        assert_eq!(h.runner.prompts(), vec![format!("[question]\n{}\n", QUESTION)]);
        assert_eq!(
            *state.wait_for(|s| s.is_terminal()).await.unwrap(),
            SessionState::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_embedding_never_contacts_runner() {
        let h = harness_with(
            CountingEmbedder::new(8).with_delay(Duration::from_millis(500)),
            Some(Arc::new(MemoryIndex::new())),
            ScriptedRunner::new(ANSWER),
            &config(),
        );

        let mut stream = h.orchestrator.handle(Query::new(QUESTION));
        let mut state = stream.state_watch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stream.state(), SessionState::Pending);

        stream.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(
            *state.wait_for(|s| s.is_terminal()).await.unwrap(),
            SessionState::Cancelled
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.embedder.calls(), 1);
        assert_eq!(h.runner.connect_attempts(), 0);
        assert!(h.runner.prompts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_silent_on_connect_is_stalled() {
        let h = harness(ScriptedRunner::new(ANSWER).hang_on_connect());

        let stream = h.orchestrator.handle(Query::new(QUESTION));
        let state = stream.state_watch();
        let started = tokio::time::Instant::now();
        let (text, err) = collect(stream).await;

        assert!(text.is_empty());
        assert!(matches!(err, Some(Error::RunnerStalled(1000))));
        assert_eq!(*state.borrow(), SessionState::Failed(ErrorKind::RunnerStalled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_search_reports_excluded_hits() {
        let h = harness(ScriptedRunner::new(ANSWER));
        h.orchestrator
            .ingest("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap();
        h.orchestrator
            .ingest("d2", "Bananas are rich in potassium", Metadata::new())
            .await
            .unwrap();

        let retrieval = h.orchestrator.search(&Query::new(QUESTION)).await.unwrap();

        let kept: Vec<&str> = retrieval.chunks.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(kept, vec!["d1"]);
        assert_eq!(retrieval.excluded.len(), 1);
        assert_eq!(retrieval.excluded[0].doc_id, "d2");
        assert_eq!(retrieval.excluded[0].reason, ExclusionReason::BelowMinScore);
        assert!(h.runner.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_search_does_not_fail_open() {
        let h = harness_with(
            CountingEmbedder::new(8),
            Some(Arc::new(FailingIndex)),
            ScriptedRunner::new(ANSWER),
            &config(),
        );
        assert!(matches!(
            h.orchestrator.search(&Query::new(QUESTION)).await,
            Err(Error::RetrievalUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_document_id_is_invalid_request() {
        let h = harness(ScriptedRunner::new(ANSWER));
        assert!(matches!(
            h.orchestrator.ingest("", "text", Metadata::new()).await,
            Err(Error::InvalidRequest(_))
        ));
        h.orchestrator.ingest("b", "two", Metadata::new()).await.unwrap();
        h.orchestrator.ingest("a", "one", Metadata::new()).await.unwrap();
        assert_eq!(h.orchestrator.list_documents().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_runner_surfaces_error() {
        let h = harness(ScriptedRunner::new(ANSWER).stall_after(2));

        let stream = h.orchestrator.handle(Query::new(QUESTION));
        let state = stream.state_watch();
        let (text, err) = collect(stream).await;

        assert_eq!(text, "Paris is");
        assert!(matches!(err, Some(Error::RunnerStalled(1000))));
        assert_eq!(*state.borrow(), SessionState::Failed(ErrorKind::RunnerStalled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_runner_is_fatal() {
        let h = harness(ScriptedRunner::new(ANSWER).refuse_first(100));

        let (text, err) = collect(h.orchestrator.handle(Query::new(QUESTION))).await;
        assert!(text.is_empty());
        let err = err.unwrap();
        assert!(matches!(err, Error::RunnerUnreachable { attempts: 3, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_spans_embedding_stage() {
        let mut config = config();
        config.request.timeout_ms = 300;
        let h = harness_with(
            CountingEmbedder::new(8).with_delay(Duration::from_millis(800)),
            Some(Arc::new(MemoryIndex::new())),
            ScriptedRunner::new(ANSWER),
            &config,
        );

        let (text, err) = collect(h.orchestrator.handle(Query::new(QUESTION))).await;
        assert!(text.is_empty());
        assert!(matches!(err, Some(Error::RequestTimeout(300))));
        assert!(h.runner.prompts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_stream_then_retry_does_not_duplicate() {
        let h = harness(ScriptedRunner::new(ANSWER).token_delay(Duration::from_millis(20)));

        let mut stream = h.orchestrator.handle(Query::new(QUESTION).with_request_id("r-1"));
        let mut state = stream.state_watch();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "Paris");

        stream.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(
            *state.wait_for(|s| s.is_terminal()).await.unwrap(),
            SessionState::Cancelled
        );
        assert_eq!(h.runner.closed_connections(), 1);

        let (text, err) = collect(h.orchestrator.handle(Query::new(QUESTION).with_request_id("r-1"))).await;
        assert!(err.is_none());
        assert_eq!(text, "Paris is the capital");
    }

    #[tokio::test]
    async fn test_query_overrides_take_precedence() {
        let h = harness(ScriptedRunner::new(ANSWER));
        h.orchestrator
            .ingest("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap();

        let (_, err) = collect(h.orchestrator.handle(Query::new(QUESTION).with_top_k(0))).await;
        assert!(err.is_none());
        assert_eq!(h.runner.prompts(), vec![format!("[question]\n{}\n", QUESTION)]);
    }

    #[tokio::test]
    async fn test_ingest_failure_keeps_stored_document() {
        let h = harness_with(
            CountingEmbedder::new(8),
            Some(Arc::new(FailingIndex)),
            ScriptedRunner::new(ANSWER),
            &config(),
        );

        let err = h
            .orchestrator
            .ingest("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetrievalUnavailable(_)));
        assert_eq!(
            h.orchestrator.get_document("d1").await.unwrap().text,
            "Paris is the capital of France"
        );
    }

    #[tokio::test]
    async fn test_deleted_document_drops_out_of_context() {
        let h = harness(ScriptedRunner::new(ANSWER));
        h.orchestrator
            .ingest("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap();
        h.orchestrator.delete_document("d1").await.unwrap();
        assert!(matches!(
            h.orchestrator.delete_document("d1").await,
            Err(Error::NotFound(_))
        ));

        let (_, err) = collect(h.orchestrator.handle(Query::new(QUESTION))).await;
        assert!(err.is_none());
        assert_eq!(h.runner.prompts(), vec![format!("[question]\n{}\n", QUESTION)]);
    }

    #[tokio::test]
    async fn test_reindex_rebuilds_memory_index() {
        let embedder = Arc::new(CountingEmbedder::new(8));
        let store = ContextStore::new(Arc::new(MemoryKv::default()));
        store
            .put("d1", "Paris is the capital of France", Metadata::new())
            .await
            .unwrap();
        store.put("d2", "Tides follow the moon", Metadata::new()).await.unwrap();

        let runner = Arc::new(ScriptedRunner::new(ANSWER));
        let orchestrator = Orchestrator::new(
            EmbeddingResolver::new(embedder, 64, Duration::from_secs(1)),
            store,
            Some(Arc::new(MemoryIndex::new())),
            runner.clone(),
            &config(),
        );

        assert_eq!(orchestrator.reindex().await.unwrap(), 2);
        let (_, err) = collect(orchestrator.handle(Query::new(QUESTION))).await;
        assert!(err.is_none());
        assert!(runner.prompts()[0].starts_with("[context:d1]"));
    }

    #[test]
    fn test_fail_open_classification() {
        assert!(matches!(
            StageOutcome::fail_open(Err::<(), _>(Error::RetrievalUnavailable("down".into()))),
            StageOutcome::Degraded(_)
        ));
        assert!(matches!(
            StageOutcome::fail_open(Err::<(), _>(Error::RequestTimeout(5))),
            StageOutcome::Fatal(_)
        ));
        assert!(matches!(StageOutcome::fail_open(Ok(1)), StageOutcome::Ok(1)));
    }

    #[test]
    fn test_query_gets_request_id() {
        let a = Query::new("q");
        let b = Query::new("q");
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(Query::new("q").with_request_id("fixed").request_id(), "fixed");
    }
}
