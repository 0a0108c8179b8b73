//! Backend abstraction layer for Sluice.
//!
//! This module defines the contracts the gateway consumes from its two
//! opaque collaborators: the text-generation backend, which produces a lazy
//! stream of tokens, and the embedding provider, which maps text to a
//! fixed-length vector.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when interacting with an inference backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// An error occurred during the API request (e.g., network issues, invalid request).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The backend returned an error while generating.
    #[error("Model Response Error: {0}")]
    ModelResponseError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The backend could not be reached at all.
    #[error("Backend Unavailable: {0}")]
    Unavailable(String),

    /// The backend type is not supported or configured.
    #[error("Unsupported Model Provider: {0}")]
    UnsupportedModelProvider(String),

    /// Other unexpected errors.
    #[error("Other Model Error: {0}")]
    Other(String),
}

/// Error returned by an embedding provider.
///
/// Every variant means the same thing to callers: semantic comparison is not
/// possible for this text right now.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// The embedding backend is down, misconfigured, or disabled.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with a vector of the wrong length.
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        /// Configured vector length.
        expected: usize,
        /// Length actually returned.
        actual: usize,
    },
}

/// Represents a message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender ("user", "assistant" or "system").
    pub role: String,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message with an arbitrary role.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

/// Parameters for controlling the backend's generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// What sampling temperature to use, between 0 and 2.
    /// Higher values mean the model will take more risks.
    pub temperature: Option<f32>,

    /// Nucleus sampling: the model considers the tokens within `top_p` probability mass.
    pub top_p: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// Sequences where the backend will stop generating further tokens.
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self { temperature: Some(0.7), top_p: Some(1.0), max_tokens: Some(512), stop_sequences: None }
    }
}

impl ModelParameters {
    /// Overlays every field that is set in `overrides` on top of `self`.
    #[must_use]
    pub fn merged_with(mut self, overrides: &Self) -> Self {
        if overrides.temperature.is_some() {
            self.temperature = overrides.temperature;
        }
        if overrides.top_p.is_some() {
            self.top_p = overrides.top_p;
        }
        if overrides.max_tokens.is_some() {
            self.max_tokens = overrides.max_tokens;
        }
        if overrides.stop_sequences.is_some() {
            self.stop_sequences.clone_from(&overrides.stop_sequences);
        }
        self
    }
}

/// A lazy, finite, non-restartable sequence of generated tokens.
///
/// The stream ends after the last token. An `Err` item is terminal.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// A trait for interacting with a text-generation backend.
///
/// All backends must be `Send + Sync` to allow concurrent use across threads,
/// even though the gateway only ever drives one generation at a time.
#[async_trait]
pub trait Model: Send + Sync {
    /// Starts generating a completion for the given prompt.
    ///
    /// # Arguments
    /// * `prompt` - The fully rendered context to send to the backend
    /// * `parameters` - Optional parameters to control generation
    ///
    /// # Errors
    /// Returns a `ModelError` if generation cannot be started. Failures after
    /// the first token arrive as an `Err` item on the stream.
    async fn generate_stream(
        &self,
        prompt: &str,
        parameters: Option<ModelParameters>,
    ) -> Result<TokenStream, ModelError>;

    /// Asks the backend to abandon the generation currently in progress.
    ///
    /// Backends without a stop signal rely on the stream being dropped.
    async fn stop(&self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Returns the ID of the model.
    fn model_id(&self) -> &str;
}

/// A trait for mapping text to a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds the given text.
    ///
    /// # Errors
    /// Returns an `EmbeddingError` when no vector can be produced.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::user("hi").role, "user");
        assert_eq!(ChatMessage::assistant("hello").role, "assistant");
        assert_eq!(ChatMessage::system("be brief").content, "be brief");
    }

    #[test]
    fn test_parameters_merge_keeps_unset_fields() {
        let overrides = ModelParameters {
            temperature: Some(0.1),
            top_p: None,
            max_tokens: None,
            stop_sequences: Some(vec!["\nUser:".to_string()]),
        };
        let merged = ModelParameters::default().merged_with(&overrides);
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.top_p, Some(1.0));
        assert_eq!(merged.max_tokens, Some(512));
        assert_eq!(merged.stop_sequences, Some(vec!["\nUser:".to_string()]));
    }

    #[test]
    fn test_model_error_display() {
        let err = ModelError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "Backend Unavailable: connection refused");
    }

    #[test]
    fn test_chat_message_wire_shape() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }

    struct Silent;

    #[async_trait]
    impl Model for Silent {
        async fn generate_stream(
            &self,
            _prompt: &str,
            _parameters: Option<ModelParameters>,
        ) -> Result<TokenStream, ModelError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        fn model_id(&self) -> &str {
            "silent"
        }
    }

    #[tokio::test]
    async fn test_default_stop_is_noop() {
        use futures::StreamExt;

        let model = Silent;
        assert!(model.stop().await.is_ok());
        let mut stream = model.generate_stream("hi", None).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_embedding_error_display() {
        let err = EmbeddingError::DimensionMismatch { expected: 384, actual: 3 };
        assert_eq!(err.to_string(), "embedding has 3 dimensions, expected 384");
    }
}
