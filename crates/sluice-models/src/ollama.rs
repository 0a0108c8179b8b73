//! Ollama inference backend.
//!
//! Streams completions from Ollama's `/api/generate` endpoint. The response
//! body is newline-delimited JSON: one `{"response": "...", "done": false}`
//! object per token batch, a final object with `"done": true`, or an
//! `{"error": "..."}` object when generation fails part-way.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sluice_abstraction::{Model, ModelError, ModelParameters, TokenStream};
use tracing::{debug, error, warn};

/// Default Ollama server URL.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Ollama model implementation.
#[derive(Debug, Clone)]
pub struct OllamaModel {
    /// The model ID (e.g., "tinyllama", "llama3:8b").
    model_id: String,
    /// The base URL for the Ollama API.
    base_url: String,
    /// HTTP client for making requests.
    client: Client,
    /// Attempts made to open a stream before giving up.
    max_attempts: u32,
    /// Pause between attempts.
    retry_delay: Duration,
}

impl OllamaModel {
    /// Creates a new `OllamaModel` against the default server URL.
    ///
    /// # Errors
    /// Returns a `ModelError` if the HTTP client cannot be created.
    pub fn new(model_id: String) -> Result<Self, ModelError> {
        Self::with_base_url(model_id, DEFAULT_OLLAMA_URL.to_string())
    }

    /// Creates a new `OllamaModel` with a custom base URL.
    ///
    /// # Arguments
    /// * `model_id` - The Ollama model ID to use
    /// * `base_url` - The base URL for the Ollama API (e.g., "http://192.168.1.100:11434")
    ///
    /// # Errors
    /// Returns a `ModelError` if the HTTP client cannot be created.
    pub fn with_base_url(model_id: String, base_url: String) -> Result<Self, ModelError> {
        Self::with_timeout(model_id, base_url, Duration::from_secs(30))
    }

    /// Creates a new `OllamaModel` whose connect and per-read timeouts are `timeout`.
    ///
    /// # Errors
    /// Returns a `ModelError` if the HTTP client cannot be created.
    pub fn with_timeout(
        model_id: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| ModelError::RequestError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            model_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_attempts: 2,
            retry_delay: Duration::from_secs(2),
        })
    }

    /// Sets how many times opening a stream is attempted and the pause between attempts.
    #[must_use]
    pub fn with_retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// Ollama API request/response structures
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>, // max_tokens equivalent
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaModel {
    /// Build OllamaOptions from ModelParameters
    fn build_options(parameters: Option<ModelParameters>) -> Option<OllamaOptions> {
        parameters.map(|p| OllamaOptions {
            temperature: p.temperature,
            top_p: p.top_p,
            num_predict: p.max_tokens,
            stop: p.stop_sequences,
        })
    }

    async fn send_once(&self, body: &OllamaGenerateRequest<'_>) -> Result<Response, ModelError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            error!(error = %e, base_url = %self.base_url, "Failed to connect to Ollama");
            if e.is_connect() || e.is_timeout() {
                ModelError::Unavailable(format!(
                    "Ollama server not reachable at {}. Start it with 'ollama serve'.",
                    self.base_url
                ))
            } else {
                ModelError::RequestError(format!("Network error: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        error!(status = %status, error = %error_text, "Ollama API returned error status");
        Err(self.classify_status(status, &error_text))
    }

    fn classify_status(&self, status: StatusCode, error_text: &str) -> ModelError {
        let message = serde_json::from_str::<OllamaError>(error_text)
            .map_or_else(|_| error_text.to_string(), |e| e.error);

        if status == StatusCode::NOT_FOUND
            || (message.contains("model") && message.contains("not found"))
        {
            return ModelError::ModelResponseError(format!(
                "Model '{}' not found. Pull it with 'ollama pull {}'.",
                self.model_id, self.model_id
            ));
        }
        if message.contains("out of memory") || message.contains("OOM") {
            return ModelError::ModelResponseError(
                "Insufficient memory to load model. Try a smaller variant.".to_string(),
            );
        }
        if status.is_server_error() {
            return ModelError::Unavailable(format!("API error ({}): {}", status, message));
        }
        ModelError::ModelResponseError(format!("API error ({}): {}", status, message))
    }

    async fn open_stream(&self, body: &OllamaGenerateRequest<'_>) -> Result<Response, ModelError> {
        let mut attempt = 1;
        loop {
            match self.send_once(body).await {
                Ok(response) => return Ok(response),
                Err(err @ (ModelError::Unavailable(_) | ModelError::RequestError(_)))
                    if attempt < self.max_attempts =>
                {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Ollama request failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Incremental decoder for Ollama's newline-delimited JSON stream.
#[derive(Debug, Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl NdjsonDecoder {
    /// Feeds a chunk of body bytes and returns the items completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, ModelError>> {
        self.buffer.extend_from_slice(chunk);
        let mut items = Vec::new();
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut items);
        }
        items
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub(crate) fn finish(&mut self) -> Vec<Result<String, ModelError>> {
        let mut items = Vec::new();
        if !self.finished {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut items);
            self.finished = true;
        }
        items
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    fn decode_line(&mut self, line: &[u8], items: &mut Vec<Result<String, ModelError>>) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<OllamaStreamChunk>(line) {
            Ok(chunk) => {
                if let Some(message) = chunk.error {
                    self.finished = true;
                    items.push(Err(ModelError::ModelResponseError(message)));
                    return;
                }
                if !chunk.response.is_empty() {
                    items.push(Ok(chunk.response));
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                self.finished = true;
                items.push(Err(ModelError::SerializationError(format!(
                    "Invalid stream chunk: {}",
                    e
                ))));
            }
        }
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<String, ModelError>>,
    exhausted: bool,
}

fn token_stream(response: Response) -> TokenStream {
    let state = StreamState {
        body: response.bytes_stream().boxed(),
        decoder: NdjsonDecoder::default(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.exhausted || state.decoder.is_finished() {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.pending.extend(state.decoder.push(&chunk)),
                Some(Err(e)) => {
                    state.exhausted = true;
                    state
                        .pending
                        .push_back(Err(ModelError::RequestError(format!("Stream interrupted: {}", e))));
                }
                None => {
                    state.exhausted = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Model for OllamaModel {
    async fn generate_stream(
        &self,
        prompt: &str,
        parameters: Option<ModelParameters>,
    ) -> Result<TokenStream, ModelError> {
        debug!(
            model_id = %self.model_id,
            prompt_len = prompt.len(),
            parameters = ?parameters,
            "OllamaModel starting stream"
        );

        let body = OllamaGenerateRequest {
            model: &self.model_id,
            prompt,
            stream: true,
            options: Self::build_options(parameters),
        };

        let response = self.open_stream(&body).await?;
        Ok(token_stream(response))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
