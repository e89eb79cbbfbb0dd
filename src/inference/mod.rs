//! Remote inference dispatch.
//!
//! A dispatch opens one session against the LLM runner and streams its
//! tokens through a bounded channel into a [`TokenStream`]. Connection
//! establishment is retried with exponential [`Backoff`]; a session that
//! goes quiet for longer than the inactivity timeout fails as stalled.

mod backoff;
mod dispatcher;
mod runner;
mod stream;

pub use backoff::Backoff;
pub use dispatcher::{DispatcherSettings, InferenceDispatcher};
pub use runner::{GenerationRequest, LlmRunner, OllamaRunner, RunnerConnection, RunnerError};
pub use stream::{Deadline, SessionState, TokenChunk, TokenStream};

pub(crate) use stream::SessionHandle;
