//! HTTP API.
//!
//! | Method | Path               | Description                         |
//! |--------|--------------------|-------------------------------------|
//! | GET    | `/health`          | Liveness and version                |
//! | POST   | `/query`           | Ask a question, NDJSON token stream |
//! | POST   | `/search`          | Retrieval only, with exclusions     |
//! | GET    | `/documents`       | List stored document ids            |
//! | POST   | `/documents`       | Store and index a document          |
//! | GET    | `/documents/{id}`  | Fetch a stored document             |
//! | DELETE | `/documents/{id}`  | Delete a document                   |
//! | GET    | `/metrics`         | Prometheus exposition               |

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::inference::TokenChunk;
use crate::orchestrator::{Orchestrator, Query};
use crate::retrieval::Retrieval;
use crate::store::{Document, Metadata};

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub start_time: Instant,
    /// Renders `/metrics`; `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Seconds since start.
    pub uptime: u64,
    pub retrieval_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub request_id: Option<String>,
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl QueryRequest {
    fn into_query(self) -> Result<Query> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidRequest("query text must not be empty".to_string()));
        }
        let mut query = Query::new(self.text);
        if let Some(id) = self.request_id {
            query = query.with_request_id(id);
        }
        if let Some(top_k) = self.top_k {
            query = query.with_top_k(top_k);
        }
        if let Some(min_score) = self.min_score {
            query = query.with_min_score(min_score);
        }
        if let Some(max_tokens) = self.max_tokens {
            query = query.with_max_tokens(max_tokens);
        }
        Ok(query)
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
}

impl SearchRequest {
    fn into_query(self) -> Result<Query> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidRequest("search text must not be empty".to_string()));
        }
        let mut query = Query::new(self.text);
        if let Some(top_k) = self.top_k {
            query = query.with_top_k(top_k);
        }
        if let Some(min_score) = self.min_score {
            query = query.with_min_score(min_score);
        }
        Ok(query)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentList {
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DocumentRequest {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One line of the `/query` response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum StreamLine {
    Token(TokenChunk),
    Error(ErrorBody),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::EmbeddingTimeout | ErrorKind::RunnerStalled | ErrorKind::RequestTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ErrorKind::EmbeddingUnavailable
            | ErrorKind::RetrievalUnavailable
            | ErrorKind::StoreUnavailable
            | ErrorKind::RunnerUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RunnerProtocol | ErrorKind::Cancelled | ErrorKind::Config | ErrorKind::Io => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "error": ErrorBody::from(&self) }))).into_response()
    }
}

/// HTTP server wrapping the orchestrator.
pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(health))
            .route("/query", post(query))
            .route("/search", post(search))
            .route("/documents", get(list_documents).post(create_document))
            .route("/documents/{id}", get(get_document).delete(delete_document))
            .route("/metrics", get(metrics))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_address).await?;
        tracing::info!("API listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.start_time.elapsed().as_secs(),
        retrieval_enabled: state.orchestrator.retrieval_enabled(),
    })
}

async fn query(State(state): State<AppState>, Json(request): Json<QueryRequest>) -> Result<Response> {
    let query = request.into_query()?;
    let tokens = state.orchestrator.handle(query);

    let lines = tokens.map(|item| {
        let line = match item {
            Ok(chunk) => StreamLine::Token(chunk),
            Err(e) => StreamLine::Error(ErrorBody::from(&e)),
        };
        let mut json = serde_json::to_string(&line).unwrap_or_else(|e| {
            format!(r#"{{"error":{{"kind":"io","message":"{}"}}}}"#, e)
        });
        json.push('\n');
        Ok::<_, Infallible>(json)
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn search(State(state): State<AppState>, Json(request): Json<SearchRequest>) -> Result<Json<Retrieval>> {
    let query = request.into_query()?;
    Ok(Json(state.orchestrator.search(&query).await?))
}

async fn list_documents(State(state): State<AppState>) -> Result<Json<DocumentList>> {
    let ids = state.orchestrator.list_documents().await?;
    Ok(Json(DocumentList { ids }))
}

async fn create_document(
    State(state): State<AppState>,
    Json(request): Json<DocumentRequest>,
) -> Result<(StatusCode, Json<Document>)> {
    let document = state
        .orchestrator
        .ingest(&request.id, &request.text, request.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn get_document(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Document>> {
    Ok(Json(state.orchestrator.get_document(&id).await?))
}

async fn delete_document(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.orchestrator.delete_document(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
