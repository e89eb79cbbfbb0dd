use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::runner::{GenerationRequest, LlmRunner, RunnerConnection, RunnerError};
use super::stream::{Deadline, SessionHandle, SessionState, TokenChunk, TokenStream};
use super::Backoff;
use crate::config::RunnerConfig;
use crate::error::{Error, Result};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Total connection attempts per session, including the first.
    pub connect_attempts: u32,
    pub backoff: Backoff,
    pub inactivity_timeout: Duration,
    pub max_concurrent_sessions: usize,
    /// Chunks buffered between the runner and a slow consumer.
    pub token_buffer: usize,
}

impl From<&RunnerConfig> for DispatcherSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            connect_attempts: config.connect_attempts,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
            inactivity_timeout: config.inactivity_timeout(),
            max_concurrent_sessions: config.max_concurrent_sessions,
            token_buffer: config.token_buffer,
        }
    }
}

/// Sends prompts to the LLM runner and streams the output back.
///
/// Each dispatch owns one session that moves through
/// `Connecting -> Streaming -> {Completed | Failed | Cancelled}`. Only
/// connection establishment is retried; once a token has been forwarded the
/// session either runs to completion or fails.
#[derive(Clone)]
pub struct InferenceDispatcher {
    runner: Arc<dyn LlmRunner>,
    settings: DispatcherSettings,
    sessions: Arc<Semaphore>,
}

impl InferenceDispatcher {
    pub fn new(runner: Arc<dyn LlmRunner>, settings: DispatcherSettings) -> Self {
        let sessions = Arc::new(Semaphore::new(settings.max_concurrent_sessions.max(1)));
        Self {
            runner,
            settings,
            sessions,
        }
    }

    pub fn token_buffer(&self) -> usize {
        self.settings.token_buffer
    }

    /// Sessions that could start right now without waiting.
    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }

    /// Start a session in the background and return its stream.
    pub fn dispatch(&self, request: GenerationRequest, deadline: Deadline) -> TokenStream {
        let (stream, session) = TokenStream::channel(self.settings.token_buffer);
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(request, deadline, session).await });
        stream
    }

    /// Drive a session to its terminal state.
    pub(crate) async fn run(&self, request: GenerationRequest, deadline: Deadline, mut session: SessionHandle) {
        let outcome = self.drive(&request, &deadline, &mut session).await;
        session.finish(outcome).await;
    }

    async fn drive(
        &self,
        request: &GenerationRequest,
        deadline: &Deadline,
        session: &mut SessionHandle,
    ) -> Result<()> {
        let _permit = session
            .guarded(deadline, self.sessions.clone().acquire_owned())
            .await?
            .map_err(|_| Error::RunnerUnreachable {
                attempts: 0,
                reason: "dispatcher is shut down".to_string(),
            })?;

        session.set_state(SessionState::Connecting);
        let (mut connection, attempts) = self.connect(request, deadline, session).await?;

        session.set_state(SessionState::Streaming);
        tracing::debug!(attempts, "Runner session open");

        let inactivity = self.settings.inactivity_timeout;
        let mut sequence = 0u64;
        loop {
            let next = session
                .guarded(deadline, tokio::time::timeout(inactivity, connection.next_token()))
                .await?;

            let token = match next {
                Err(_) => return Err(Error::RunnerStalled(inactivity.as_millis() as u64)),
                Ok(Err(RunnerError::Protocol(message))) => return Err(Error::RunnerProtocol(message)),
                Ok(Err(RunnerError::Connect(reason))) => {
                    return Err(Error::RunnerUnreachable { attempts, reason })
                }
                Ok(Ok(token)) => token,
            };

            match token {
                Some(text) => {
                    session
                        .send(deadline, TokenChunk { sequence, text, done: false })
                        .await?;
                    sequence += 1;
                }
                None => {
                    session
                        .send(
                            deadline,
                            TokenChunk {
                                sequence,
                                text: String::new(),
                                done: true,
                            },
                        )
                        .await?;
                    tracing::debug!(tokens = sequence, "Runner session completed");
                    return Ok(());
                }
            }
        }
    }

    /// Open a connection, retrying connection failures with backoff. A runner
    /// that accepts but stays silent past the inactivity timeout is stalled.
    /// Returns the connection and the number of attempts it took.
    async fn connect(
        &self,
        request: &GenerationRequest,
        deadline: &Deadline,
        session: &mut SessionHandle,
    ) -> Result<(Box<dyn RunnerConnection>, u32)> {
        let max_attempts = self.settings.connect_attempts.max(1);
        let inactivity = self.settings.inactivity_timeout;
        let mut failures = 0u32;
        loop {
            let attempt = tokio::time::timeout(inactivity, self.runner.connect(request));
            match session.guarded(deadline, attempt).await? {
                Err(_) => return Err(Error::RunnerStalled(inactivity.as_millis() as u64)),
                Ok(Ok(connection)) => return Ok((connection, failures + 1)),
                Ok(Err(RunnerError::Protocol(message))) => return Err(Error::RunnerProtocol(message)),
                Ok(Err(RunnerError::Connect(reason))) => {
                    failures += 1;
                    if failures >= max_attempts {
                        return Err(Error::RunnerUnreachable {
                            attempts: failures,
                            reason,
                        });
                    }
                    let delay = self.settings.backoff.delay(failures);
                    tracing::warn!(
                        attempt = failures,
                        max_attempts,
                        "Runner connection failed, retrying in {:?}: {}",
                        delay,
                        reason
                    );
                    metrics::counter!("ragnode_runner_connect_retries_total").increment(1);
                    session.guarded(deadline, tokio::time::sleep(delay)).await?;
                }
            }
        }
    }
}
