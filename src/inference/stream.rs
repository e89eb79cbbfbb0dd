use futures::Stream;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{Error, ErrorKind, Result};

/// One increment of streamed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenChunk {
    /// Position within the session, starting at 0 with no gaps.
    pub sequence: u64,
    pub text: String,
    /// Set on the final chunk only; its text is empty.
    pub done: bool,
}

/// Lifecycle of an inference session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; earlier stages or a session permit are still pending.
    Pending,
    Connecting,
    Streaming,
    Completed,
    Failed(ErrorKind),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed(_) | SessionState::Cancelled
        )
    }
}

/// A point in time shared by every stage of one request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub async fn elapsed(&self) {
        tokio::time::sleep_until(self.at).await
    }

    /// The error reported when this deadline fires.
    pub fn error(&self) -> Error {
        Error::RequestTimeout(self.budget.as_millis() as u64)
    }
}

/// Lazy, finite stream of token chunks for one request.
///
/// Yields `Ok` chunks until the chunk with `done` set, or a single `Err`
/// ending the stream. Cancelling, or dropping the stream, closes the runner
/// connection; nothing is yielded afterwards.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<TokenChunk>>,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    cancelled: bool,
}

impl TokenStream {
    /// A stream and the producer half that feeds it. `buffer` bounds how far
    /// the producer may run ahead of the consumer.
    pub(crate) fn channel(buffer: usize) -> (TokenStream, SessionHandle) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Pending);
        (
            TokenStream {
                rx,
                cancel: cancel_tx,
                state: state_rx,
                cancelled: false,
            },
            SessionHandle {
                tx,
                cancel: cancel_rx,
                state: state_tx,
            },
        )
    }

    /// Stop the session; no further items are yielded.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        let _ = self.cancel.send(true);
        self.rx.close();
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch the session state.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Drain the stream into the generated text.
    pub async fn collect_text(mut self) -> Result<String> {
        use futures::StreamExt;

        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?.text);
        }
        Ok(text)
    }
}

impl Stream for TokenStream {
    type Item = Result<TokenChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Producer half of a [`TokenStream`].
pub(crate) struct SessionHandle {
    tx: mpsc::Sender<Result<TokenChunk>>,
    cancel: watch::Receiver<bool>,
    state: watch::Sender<SessionState>,
}

impl SessionHandle {
    pub(crate) fn set_state(&self, state: SessionState) {
        tracing::debug!(?state, "Session state");
        self.state.send_replace(state);
    }

    /// Run `fut` unless the owner cancels or the deadline fires first.
    pub(crate) async fn guarded<F: Future>(&mut self, deadline: &Deadline, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Err(Error::Cancelled),
            _ = deadline.elapsed() => Err(deadline.error()),
            out = fut => Ok(out),
        }
    }

    /// Hand a chunk to the consumer, waiting while its buffer is full.
    pub(crate) async fn send(&mut self, deadline: &Deadline, chunk: TokenChunk) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Err(Error::Cancelled),
            _ = deadline.elapsed() => Err(deadline.error()),
            sent = self.tx.send(Ok(chunk)) => sent.map_err(|_| Error::Cancelled),
        }
    }

    /// Record the terminal state and report a failure to the consumer.
    pub(crate) async fn finish(self, outcome: Result<()>) {
        let label = match &outcome {
            Ok(()) => "completed",
            Err(e) => e.kind().as_str(),
        };
        metrics::counter!("ragnode_request_outcomes_total", "kind" => label).increment(1);

        match outcome {
            Ok(()) => self.set_state(SessionState::Completed),
            Err(Error::Cancelled) => {
                tracing::info!("Session cancelled");
                self.set_state(SessionState::Cancelled);
            }
            Err(e) => {
                tracing::warn!(kind = e.kind().as_str(), "Session failed: {}", e);
                self.set_state(SessionState::Failed(e.kind()));
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }
}

/// Resolves once the owner cancels or drops the stream.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}
