use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, Result};

/// Failure talking to the LLM runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    /// The connection could not be established or was lost. Retryable while
    /// connecting.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The runner answered but the exchange is invalid. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A generation job sent to the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
}

/// Remote LLM runner capability.
#[async_trait]
pub trait LlmRunner: Send + Sync {
    /// Open a generation session.
    async fn connect(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<Box<dyn RunnerConnection>, RunnerError>;
}

/// One open generation session. Dropping it closes the connection.
#[async_trait]
pub trait RunnerConnection: Send {
    /// Next token, `None` once the runner signals end of generation.
    async fn next_token(&mut self) -> std::result::Result<Option<String>, RunnerError>;
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

/// Runner speaking the Ollama streaming `/api/generate` protocol.
pub struct OllamaRunner {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaRunner {
    /// `address` is `host:port` or a full base URL.
    pub fn new(address: &str, model: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build runner client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url(address),
            model: model.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[async_trait]
impl LlmRunner for OllamaRunner {
    async fn connect(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<Box<dyn RunnerConnection>, RunnerError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: true,
            options: GenerateOptions {
                num_predict: request.max_tokens,
            },
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::Protocol(format!("runner error ({}): {}", status, body)));
        }

        Ok(Box::new(OllamaConnection {
            response,
            decoder: GenerateDecoder::default(),
        }))
    }
}

/// A send that never got a response back (refused, reset or closed before
/// the status line) is a connection failure; anything else is protocol.
fn send_error(e: reqwest::Error) -> RunnerError {
    let no_response = e.status().is_none();
    if no_response && (e.is_connect() || e.is_timeout() || e.is_request()) {
        RunnerError::Connect(e.to_string())
    } else {
        RunnerError::Protocol(e.to_string())
    }
}

struct OllamaConnection {
    response: reqwest::Response,
    decoder: GenerateDecoder,
}

#[async_trait]
impl RunnerConnection for OllamaConnection {
    async fn next_token(&mut self) -> std::result::Result<Option<String>, RunnerError> {
        loop {
            if let Some(next) = self.decoder.next_token()? {
                return Ok(next);
            }
            let chunk = self
                .response
                .chunk()
                .await
                .map_err(|e| RunnerError::Connect(e.to_string()))?;
            match chunk {
                Some(bytes) => self.decoder.push(&bytes),
                None => return self.decoder.finish(),
            }
        }
    }
}

/// Incremental decoder for the NDJSON generate stream.
#[derive(Debug, Default)]
struct GenerateDecoder {
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl GenerateDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// `Some(token)` or `Some(None)` at end of generation when the buffered
    /// input decides it; `None` when more input is needed.
    fn next_token(&mut self) -> std::result::Result<Option<Option<String>>, RunnerError> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(Some(token)));
            }
            if self.done {
                return Ok(Some(None));
            }
            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.decode_line(&line)?;
        }
    }

    /// End of input: decode any unterminated last line.
    fn finish(&mut self) -> std::result::Result<Option<String>, RunnerError> {
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest)?;
        match self.next_token()? {
            Some(next) => Ok(next),
            None => Err(RunnerError::Protocol(
                "stream ended before generation completed".to_string(),
            )),
        }
    }

    fn decode_line(&mut self, line: &[u8]) -> std::result::Result<(), RunnerError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(());
        }
        let parsed: GenerateLine = serde_json::from_slice(line)
            .map_err(|e| RunnerError::Protocol(format!("invalid stream line: {}", e)))?;
        if let Some(error) = parsed.error {
            return Err(RunnerError::Protocol(error));
        }
        if !parsed.response.is_empty() {
            self.pending.push_back(parsed.response);
        }
        if parsed.done {
            self.done = true;
        }
        Ok(())
    }
}
