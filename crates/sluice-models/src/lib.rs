//! Backend implementations and response caches for Sluice.
//!
//! This crate provides concrete implementations of the `Model` and
//! `Embedder` traits plus the two cache tiers that sit in front of them.
//!
//! # Backends
//!
//! - **Mock**: Scripted token streams for testing and development
//! - **Ollama**: Local models via Ollama's streaming generate API
//!
//! # Embedders
//!
//! - **Ollama**: `/api/embeddings` on the same server
//! - **Hashing**: Deterministic, offline, feature-hashed vectors
//! - **Disabled**: Semantic caching switched off

pub mod cache;
pub mod embeddings;
pub mod factory;
pub mod ollama;
pub mod tokens;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sluice_abstraction::{Model, ModelError, ModelParameters, TokenStream};
use tracing::debug;

pub use cache::{
    CacheConfig, CacheConfigError, CacheEntry, CacheKey, CacheStats, CacheTier, ExactCache,
    SemanticCache, SemanticHit,
};
pub use embeddings::{DisabledEmbedder, HashingEmbedder, OllamaEmbedder, cosine_similarity};
pub use factory::{
    BackendKind, EmbedderKind, EmbeddingConfig, ModelConfig, ModelFactory,
};
pub use ollama::OllamaModel;
pub use tokens::count_tokens;

/// A scripted implementation of the `Model` trait for testing and demonstration.
///
/// Every call replays the same token script, optionally pausing between tokens
/// and optionally failing. Clones share their call log.
#[derive(Debug, Clone)]
pub struct MockModel {
    id: String,
    tokens: Vec<String>,
    token_delay: Duration,
    fail_after: Option<usize>,
    fail_to_start: Option<String>,
    calls: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new("mock".to_string())
    }
}

impl MockModel {
    /// Creates a new `MockModel` with the given ID.
    #[must_use]
    pub fn new(id: String) -> Self {
        Self {
            id,
            tokens: ["This ", "is ", "a ", "mock ", "response."].map(String::from).to_vec(),
            token_delay: Duration::ZERO,
            fail_after: None,
            fail_to_start: None,
            calls: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replaces the token script with the words of `text`, spaces kept.
    #[must_use]
    pub fn with_response(mut self, text: &str) -> Self {
        self.tokens = text.split_inclusive(' ').map(String::from).collect();
        self
    }

    /// Replaces the token script verbatim.
    #[must_use]
    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Sleeps for `delay` before emitting each token.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Emits `count` tokens, then a terminal error.
    #[must_use]
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Refuses to start any stream.
    #[must_use]
    pub fn failing_to_start(mut self, message: impl Into<String>) -> Self {
        self.fail_to_start = Some(message.into());
        self
    }

    /// Number of `generate_stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls so far.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// The full text one successful call produces.
    pub fn script_text(&self) -> String {
        self.tokens.concat()
    }
}

#[async_trait]
impl Model for MockModel {
    async fn generate_stream(
        &self,
        prompt: &str,
        parameters: Option<ModelParameters>,
    ) -> Result<TokenStream, ModelError> {
        debug!(
            model_id = %self.id,
            prompt_len = prompt.len(),
            parameters = ?parameters,
            "MockModel starting stream"
        );

        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        if let Some(message) = &self.fail_to_start {
            return Err(ModelError::Unavailable(message.clone()));
        }

        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        let limit = self.fail_after.unwrap_or(usize::MAX);
        let fails = self.fail_after.is_some();

        let stream = futures::stream::unfold(0_usize, move |index| {
            let tokens = tokens.clone();
            async move {
                if index >= limit {
                    if fails && index == limit {
                        return Some((
                            Err(ModelError::ModelResponseError("mock generation failed".to_string())),
                            index + 1,
                        ));
                    }
                    return None;
                }
                let token = tokens.get(index)?.clone();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(token), index + 1))
            }
        });

        Ok(stream.boxed())
    }

    async fn stop(&self) -> Result<(), ModelError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_mock_model_streams_script() {
        let model = MockModel::new("test-model".to_string()).with_response("Hello there world");
        let stream = model.generate_stream("Say hello", None).await.unwrap();
        let tokens: Vec<String> = stream.try_collect().await.unwrap();

        assert_eq!(tokens, vec!["Hello ", "there ", "world"]);
        assert_eq!(model.calls(), 1);
        assert_eq!(model.prompts(), vec!["Say hello".to_string()]);
        assert_eq!(model.model_id(), "test-model");
    }

    #[tokio::test]
    async fn test_mock_model_fails_after_count() {
        let model = MockModel::default().with_tokens(["a", "b", "c"]).failing_after(2);
        let mut stream = model.generate_stream("x", None).await.unwrap();

        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        assert_eq!(stream.next().await, Some(Ok("b".to_string())));
        assert!(matches!(stream.next().await, Some(Err(ModelError::ModelResponseError(_)))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_mock_model_fails_to_start() {
        let model = MockModel::default().failing_to_start("backend down");
        let result = model.generate_stream("x", None).await;
        assert!(matches!(result, Err(ModelError::Unavailable(_))));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_model_clones_share_counters() {
        let model = MockModel::default();
        let clone = model.clone();
        clone.stop().await.unwrap();
        let _ = clone.generate_stream("x", None).await.unwrap();
        assert_eq!(model.stops(), 1);
        assert_eq!(model.calls(), 1);
    }
}
