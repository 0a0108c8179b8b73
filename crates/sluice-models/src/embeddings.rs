//! Embedding providers.
//!
//! Three implementations of the `Embedder` trait:
//! - [`OllamaEmbedder`] calls a local Ollama server's `/api/embeddings` endpoint.
//! - [`HashingEmbedder`] builds a feature-hashed bag-of-words vector offline.
//! - [`DisabledEmbedder`] always reports the provider as unavailable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sluice_abstraction::{Embedder, EmbeddingError};
use tracing::{debug, warn};

/// Dimension of the hashing embedder's vectors.
pub const DEFAULT_HASHING_DIMENSIONS: usize = 384;

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for vectors of different length, empty vectors, or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Embeddings served by an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    model: String,
    base_url: String,
    dimensions: usize,
    client: Client,
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    /// Creates an embedder for `model` at `base_url`.
    ///
    /// # Errors
    /// Returns `EmbeddingError::Unavailable` if the HTTP client cannot be built.
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dimensions,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&OllamaEmbeddingRequest { model: &self.model, prompt: text })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, base_url = %self.base_url, "Embedding request failed");
                EmbeddingError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Embedding endpoint returned error status");
            return Err(EmbeddingError::Unavailable(format!("status {status}: {body}")));
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("invalid embedding response: {e}")))?;

        if parsed.embedding.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: parsed.embedding.len(),
            });
        }

        debug!(model = %self.model, dimensions = self.dimensions, "Computed embedding");
        Ok(parsed.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic offline embedder.
///
/// Each lowercased word, stripped of surrounding punctuation, is hashed into a
/// signed bucket; the result is L2-normalized. Texts sharing the same words
/// map to the same vector regardless of punctuation and spacing.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    /// Creates a hashing embedder producing vectors of length `dimensions`.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for word in text.split_whitespace() {
            let feature = word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if feature.is_empty() {
                continue;
            }
            let digest = Sha256::digest(feature.as_bytes());
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            let hash = u64::from_le_bytes(bytes);
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Embedder used when semantic caching is switched off.
#[derive(Debug, Clone, Default)]
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable("embeddings are disabled".to_string()))
    }

    fn dimensions(&self) -> usize {
        0
    }
}
