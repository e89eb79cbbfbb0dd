//! Error types for the RAG node.
//!
//! Every failure carries an [`ErrorKind`] so callers can tell retryable
//! availability problems apart from timeouts and cancellation.

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the orchestration core and its capabilities.
#[derive(Debug, Error)]
pub enum Error {
    /// No embedding backend is configured or the backend failed.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The embedding backend did not answer within its time bound.
    #[error("Embedding timed out after {0}ms")]
    EmbeddingTimeout(u64),

    /// The vector index is unconfigured or unreachable.
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The key-value store failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A document id is absent from the store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connection attempts to the LLM runner were exhausted.
    #[error("Runner unreachable after {attempts} attempts: {reason}")]
    RunnerUnreachable { attempts: u32, reason: String },

    /// The runner stopped producing output for longer than the inactivity timeout.
    #[error("Runner stalled: no output for {0}ms")]
    RunnerStalled(u64),

    /// The runner answered with a protocol-level failure.
    #[error("Runner protocol error: {0}")]
    RunnerProtocol(String),

    /// The per-request deadline elapsed.
    #[error("Request timed out after {0}ms")]
    RequestTimeout(u64),

    /// The request was cancelled by its owner.
    #[error("Request cancelled")]
    Cancelled,

    /// The caller's request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable tag for an [`Error`], suitable for wire formats and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmbeddingUnavailable,
    EmbeddingTimeout,
    RetrievalUnavailable,
    StoreUnavailable,
    NotFound,
    RunnerUnreachable,
    RunnerStalled,
    RunnerProtocol,
    RequestTimeout,
    Cancelled,
    InvalidRequest,
    Config,
    Io,
}

impl ErrorKind {
    /// Whether retrying the same request later may succeed.
    ///
    /// Network and availability failures are retryable; timeouts,
    /// cancellation and protocol failures are not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::EmbeddingUnavailable
                | ErrorKind::RetrievalUnavailable
                | ErrorKind::StoreUnavailable
                | ErrorKind::RunnerUnreachable
                | ErrorKind::RunnerStalled
        )
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::EmbeddingUnavailable => "embedding_unavailable",
            ErrorKind::EmbeddingTimeout => "embedding_timeout",
            ErrorKind::RetrievalUnavailable => "retrieval_unavailable",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RunnerUnreachable => "runner_unreachable",
            ErrorKind::RunnerStalled => "runner_stalled",
            ErrorKind::RunnerProtocol => "runner_protocol",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }
}

impl Error {
    /// The kind tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Error::EmbeddingTimeout(_) => ErrorKind::EmbeddingTimeout,
            Error::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            Error::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::RunnerUnreachable { .. } => ErrorKind::RunnerUnreachable,
            Error::RunnerStalled(_) => ErrorKind::RunnerStalled,
            Error::RunnerProtocol(_) => ErrorKind::RunnerProtocol,
            Error::RequestTimeout(_) => ErrorKind::RequestTimeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::RetrievalUnavailable(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}
