//! Backend factory for creating model and embedder instances from configuration.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_abstraction::{Embedder, EmbeddingError, Model, ModelError};
use tracing::{debug, warn};

use crate::embeddings::{DisabledEmbedder, HashingEmbedder, OllamaEmbedder};
use crate::ollama::DEFAULT_OLLAMA_URL;
use crate::{MockModel, OllamaModel};

/// Inference backend enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Scripted backend for testing.
    Mock,
    /// Ollama local model.
    Ollama,
}

impl FromStr for BackendKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "ollama" => Ok(Self::Ollama),
            other => Err(ModelError::UnsupportedModelProvider(other.to_string())),
        }
    }
}

/// Embedding provider enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Ollama `/api/embeddings`.
    Ollama,
    /// Offline feature hashing.
    Hashing,
    /// No embeddings; the semantic tier always misses.
    Disabled,
}

impl FromStr for EmbedderKind {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "hashing" | "hash" => Ok(Self::Hashing),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(EmbeddingError::Unavailable(format!("unknown embedding provider '{other}'"))),
        }
    }
}

/// Inference backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Which backend to drive.
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Model name passed to the backend.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Backend server URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Connect and read timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts made to open a generation stream.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_backend() -> BackendKind {
    BackendKind::Ollama
}

fn default_model_name() -> String {
    "tinyllama".to_string()
}

fn default_base_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model_name: default_model_name(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Which provider to use.
    #[serde(default = "default_provider")]
    pub provider: EmbedderKind,

    /// Embedding model name (Ollama provider only).
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Server URL; falls back to the inference backend's URL when unset.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Expected vector length.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> EmbedderKind {
    EmbedderKind::Hashing
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimensions() -> usize {
    crate::embeddings::DEFAULT_HASHING_DIMENSIONS
}

fn default_embedding_timeout_secs() -> u64 {
    5
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            base_url: None,
            dimensions: default_dimensions(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

/// Factory for creating backend instances.
pub struct ModelFactory;

impl ModelFactory {
    /// Creates a model instance from the given configuration.
    ///
    /// # Errors
    /// Returns a `ModelError` if the backend cannot be constructed.
    pub fn create(config: &ModelConfig) -> Result<Arc<dyn Model + Send + Sync>, ModelError> {
        debug!(
            backend = ?config.backend,
            model_id = %config.model_name,
            "Creating model instance"
        );

        match config.backend {
            BackendKind::Mock => Ok(Arc::new(MockModel::new(config.model_name.clone()))),
            BackendKind::Ollama => {
                let model = OllamaModel::with_timeout(
                    config.model_name.clone(),
                    config.base_url.clone(),
                    Duration::from_secs(config.timeout_secs),
                )?
                .with_retries(config.max_retries, Duration::from_millis(config.retry_delay_ms));
                Ok(Arc::new(model))
            }
        }
    }

    /// Creates a model instance from a backend name and model name.
    ///
    /// # Errors
    /// Returns a `ModelError` if the backend name is unknown.
    pub fn create_from_str(
        backend: &str,
        model_name: String,
    ) -> Result<Arc<dyn Model + Send + Sync>, ModelError> {
        let backend = backend.parse::<BackendKind>()?;
        Self::create(&ModelConfig { backend, model_name, ..ModelConfig::default() })
    }

    /// Creates an embedder from configuration.
    ///
    /// A provider that cannot be built degrades to [`DisabledEmbedder`]: the
    /// semantic tier then misses on every lookup.
    pub fn create_embedder(
        config: &EmbeddingConfig,
        backend_url: &str,
    ) -> Arc<dyn Embedder + Send + Sync> {
        match config.provider {
            EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(config.dimensions)),
            EmbedderKind::Disabled => Arc::new(DisabledEmbedder),
            EmbedderKind::Ollama => {
                let base_url = config.base_url.as_deref().unwrap_or(backend_url);
                match OllamaEmbedder::new(
                    config.model.clone(),
                    base_url,
                    config.dimensions,
                    Duration::from_secs(config.timeout_secs),
                ) {
                    Ok(embedder) => Arc::new(embedder),
                    Err(e) => {
                        warn!(error = %e, "Embedding provider unavailable, semantic cache disabled");
                        Arc::new(DisabledEmbedder)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("mock".parse::<BackendKind>().unwrap(), BackendKind::Mock);
        assert_eq!("Ollama".parse::<BackendKind>().unwrap(), BackendKind::Ollama);
        assert!(matches!(
            "gpt".parse::<BackendKind>(),
            Err(ModelError::UnsupportedModelProvider(_))
        ));
    }

    #[test]
    fn test_embedder_kind_from_str() {
        assert_eq!("hash".parse::<EmbedderKind>().unwrap(), EmbedderKind::Hashing);
        assert_eq!("off".parse::<EmbedderKind>().unwrap(), EmbedderKind::Disabled);
        assert!("word2vec".parse::<EmbedderKind>().is_err());
    }

    #[test]
    fn test_model_config_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.backend, BackendKind::Ollama);
        assert_eq!(config.model_name, "tinyllama");
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay_ms, 2000);
    }

    #[test]
    fn test_model_config_deserialize_partial() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"backend":"mock","model_name":"tiny"}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.model_name, "tiny");
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_factory_create_mock() {
        let model = ModelFactory::create_from_str("mock", "mock-model".to_string()).unwrap();
        assert_eq!(model.model_id(), "mock-model");
    }

    #[test]
    fn test_factory_create_ollama() {
        let config = ModelConfig { model_name: "llama3".to_string(), ..ModelConfig::default() };
        let model = ModelFactory::create(&config).unwrap();
        assert_eq!(model.model_id(), "llama3");
    }

    #[test]
    fn test_factory_create_invalid_type() {
        assert!(ModelFactory::create_from_str("invalid", "x".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_factory_create_embedders() {
        let hashing = ModelFactory::create_embedder(&EmbeddingConfig::default(), "http://unused");
        assert_eq!(hashing.dimensions(), 384);
        assert!(hashing.embed("hello").await.is_ok());

        let disabled = EmbeddingConfig { provider: EmbedderKind::Disabled, ..EmbeddingConfig::default() };
        let disabled = ModelFactory::create_embedder(&disabled, "http://unused");
        assert!(disabled.embed("hello").await.is_err());
    }
}
