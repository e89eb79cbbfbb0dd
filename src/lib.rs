//! ragnode - retrieval-augmented generation node.
//!
//! Answers questions by embedding the query, retrieving the nearest stored
//! documents, assembling a bounded prompt and streaming the LLM runner's
//! output back to the caller.
//!
//! # Modules
//!
//! - [`embedding`]: query embeddings with a shared LRU cache
//! - [`retrieval`]: nearest-neighbour hits resolved to stored text
//! - [`store`]: durable documents over RocksDB
//! - [`index`]: vector index capability (Qdrant or in-process)
//! - [`prompt`]: deterministic prompt assembly
//! - [`inference`]: streamed dispatch to the LLM runner
//! - [`orchestrator`]: per-request sequencing, deadline and fail-open policy
//! - [`api`]: HTTP surface

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod inference;
pub mod orchestrator;
pub mod prompt;
pub mod retrieval;
pub mod store;

#[cfg(test)]
mod testing;

pub use api::{ApiServer, AppState, HealthResponse};
pub use config::Config;
pub use embedding::{EmbeddingResolver, EmbeddingVector};
pub use error::{Error, ErrorKind, Result};
pub use index::VectorIndex;
pub use inference::{InferenceDispatcher, OllamaRunner, SessionState, TokenChunk, TokenStream};
pub use orchestrator::{Orchestrator, Query, StageOutcome};
pub use prompt::{AssembledPrompt, TEMPLATE_VERSION};
pub use retrieval::{Retrieval, RetrievalCoordinator, RetrievedChunk, TieBreak};
pub use store::{ContextStore, Document, KeyValueStore, Metadata, RocksDbStore};
