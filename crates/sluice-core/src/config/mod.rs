//! Configuration module for Sluice.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional TOML file, and environment variables.

use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sluice_models::{BackendKind, CacheConfig, CacheConfigError, EmbedderKind, EmbeddingConfig, ModelConfig};
use sluice_orchestrator::{ContextConfig, OrchestratorConfig, QueueConfig};
use thiserror::Error;

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_PATH_ENV: &str = "SLUICE_CONFIG";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment variable holds an unusable value.
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Cache settings out of range.
    #[error(transparent)]
    Cache(#[from] CacheConfigError),

    /// Any other setting out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address to bind the HTTP server to.
    #[serde(default = "default_address")]
    pub address: SocketAddr,
}

fn default_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8001))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: default_address() }
    }
}

/// Where session history lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    /// Process memory; lost on restart.
    Memory,
    /// One JSONL file per session under `history.dir`.
    Jsonl,
}

impl FromStr for HistoryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "jsonl" | "file" => Ok(Self::Jsonl),
            other => Err(format!("unknown history backend '{other}'")),
        }
    }
}

/// Session history configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Store implementation.
    #[serde(default = "default_history_backend")]
    pub backend: HistoryBackend,
    /// Root directory of the JSONL store.
    #[serde(default = "default_history_dir")]
    pub dir: PathBuf,
}

fn default_history_backend() -> HistoryBackend {
    HistoryBackend::Memory
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("data/sessions")
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { backend: default_history_backend(), dir: default_history_dir() }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Root configuration for Sluice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Inference backend.
    #[serde(default)]
    pub model: ModelConfig,
    /// Embedding provider for the semantic cache.
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    /// Response caches.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Admission queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Context window.
    #[serde(default)]
    pub context: ContextConfig,
    /// Per-request settings.
    #[serde(default)]
    pub request: OrchestratorConfig,
    /// Session history.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from `path` (or `SLUICE_CONFIG`) and the process environment.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if any value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Like [`load`](Self::load) with an explicit variable lookup.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if any value is invalid.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.map(Path::to_path_buf).or_else(|| lookup(CONFIG_PATH_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file. Missing sections and fields take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Ok(toml::from_str(&content)?)
    }

    /// Overrides fields from environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable is set to an unparseable value.
    pub fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(lookup, "BIND_ADDRESS")? {
            self.server.address = v;
        }

        if let Some(v) = parse_var::<BackendKind, _>(lookup, "MODEL_BACKEND")? {
            self.model.backend = v;
        }
        if let Some(v) = lookup("MODEL_SERVER_URL") {
            self.model.base_url = v;
        }
        if let Some(v) = lookup("MODEL_NAME") {
            self.model.model_name = v;
        }
        if let Some(v) = parse_var(lookup, "MODEL_SERVER_TIMEOUT")? {
            self.model.timeout_secs = v;
        }
        if let Some(v) = parse_var(lookup, "MODEL_MAX_RETRIES")? {
            self.model.max_retries = v;
        }
        if let Some(v) = parse_var(lookup, "MODEL_RETRY_DELAY_MS")? {
            self.model.retry_delay_ms = v;
        }

        if let Some(v) = parse_var::<EmbedderKind, _>(lookup, "EMBEDDING_PROVIDER")? {
            self.embeddings.provider = v;
        }
        if let Some(v) = lookup("EMBEDDING_MODEL") {
            self.embeddings.model = v;
        }

        if let Some(v) = parse_var(lookup, "L1_CACHE_TTL")? {
            self.cache.l1_ttl_secs = v;
        }
        if let Some(v) = parse_var(lookup, "L2_CACHE_TTL")? {
            self.cache.l2_ttl_secs = v;
        }
        if let Some(v) = parse_var(lookup, "SIMILARITY_THRESHOLD")? {
            self.cache.similarity_threshold = v;
        }
        if let Some(v) = parse_var(lookup, "L1_CACHE_MAX_ENTRIES")? {
            self.cache.l1_max_entries = v;
        }
        if let Some(v) = parse_var(lookup, "L2_CACHE_MAX_ENTRIES")? {
            self.cache.l2_max_entries = v;
        }

        if let Some(v) = parse_var(lookup, "MAX_QUEUE_SIZE")? {
            self.queue.max_queue_size = v;
        }
        if let Some(v) = parse_var(lookup, "REQUEST_TIMEOUT")? {
            self.request.request_timeout_secs = v;
        }
        if let Some(v) = parse_var(lookup, "MAX_CONTEXT_TOKENS")? {
            self.context.max_context_tokens = v;
        }
        if let Some(v) = parse_var(lookup, "MAX_HISTORY_MESSAGES")? {
            self.context.max_history_messages = v;
        }
        if let Some(v) = lookup("SYSTEM_PROMPT") {
            self.context.system_prompt = v;
        }

        if let Some(v) = parse_var::<HistoryBackend, _>(lookup, "HISTORY_BACKEND")? {
            self.history.backend = v;
        }
        if let Some(v) = lookup("HISTORY_DIR") {
            self.history.dir = PathBuf::from(v);
        }

        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = parse_var::<LogFormat, _>(lookup, "LOG_FORMAT")? {
            self.logging.format = v;
        }
        Ok(())
    }

    /// Checks every section for out-of-range values.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("queue.max_queue_size must be greater than 0".to_string()));
        }
        if self.request.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request.request_timeout_secs must be greater than 0".to_string()));
        }
        if self.request.channel_capacity < 2 {
            return Err(ConfigError::Invalid("request.channel_capacity must be at least 2".to_string()));
        }
        if self.context.max_context_tokens == 0 {
            return Err(ConfigError::Invalid("context.max_context_tokens must be greater than 0".to_string()));
        }
        if self.model.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid("model.model_name must not be empty".to_string()));
        }
        if self.embeddings.dimensions == 0 {
            return Err(ConfigError::Invalid("embeddings.dimensions must be greater than 0".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map(Some).map_err(|e| ConfigError::InvalidEnv { name, value, reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_with(None, env(&[])).unwrap();
        assert_eq!(config.server.address, "127.0.0.1:8001".parse().unwrap());
        assert_eq!(config.cache.l1_ttl_secs, 86_400);
        assert_eq!(config.cache.l2_ttl_secs, 604_800);
        assert!((config.cache.similarity_threshold - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.queue.max_queue_size, 50);
        assert_eq!(config.context.max_context_tokens, 4096);
        assert_eq!(config.context.max_history_messages, 50);
        assert_eq!(config.request.request_timeout_secs, 60);
        assert_eq!(config.model.model_name, "tinyllama");
        assert_eq!(config.history.backend, HistoryBackend::Memory);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_env_overrides() {
        let lookup = env(&[
            ("BIND_ADDRESS", "0.0.0.0:9000"),
            ("MODEL_BACKEND", "mock"),
            ("MODEL_NAME", "llama3"),
            ("L1_CACHE_TTL", "60"),
            ("SIMILARITY_THRESHOLD", "0.9"),
            ("MAX_QUEUE_SIZE", "5"),
            ("REQUEST_TIMEOUT", "10"),
            ("MAX_CONTEXT_TOKENS", "2048"),
            ("EMBEDDING_PROVIDER", "disabled"),
            ("HISTORY_BACKEND", "jsonl"),
            ("HISTORY_DIR", "/tmp/sessions"),
            ("LOG_FORMAT", "json"),
        ]);
        let config = Config::load_with(None, lookup).unwrap();

        assert_eq!(config.server.address, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.model.backend, BackendKind::Mock);
        assert_eq!(config.model.model_name, "llama3");
        assert_eq!(config.cache.l1_ttl_secs, 60);
        assert!((config.cache.similarity_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.queue.max_queue_size, 5);
        assert_eq!(config.request.request_timeout_secs, 10);
        assert_eq!(config.context.max_context_tokens, 2048);
        assert_eq!(config.embeddings.provider, EmbedderKind::Disabled);
        assert_eq!(config.history.backend, HistoryBackend::Jsonl);
        assert_eq!(config.history.dir, PathBuf::from("/tmp/sessions"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_env_value() {
        let result = Config::load_with(None, env(&[("MAX_QUEUE_SIZE", "lots")]));
        assert!(matches!(result, Err(ConfigError::InvalidEnv { name: "MAX_QUEUE_SIZE", .. })));
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let result = Config::load_with(None, env(&[("SIMILARITY_THRESHOLD", "1.5")]));
        assert!(matches!(result, Err(ConfigError::Cache(CacheConfigError::InvalidSimilarityThreshold(_)))));

        let result = Config::load_with(None, env(&[("MAX_QUEUE_SIZE", "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_then_env() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
address = "127.0.0.1:7000"

[model]
backend = "mock"
model_name = "from-file"

[cache]
l2_ttl_secs = 120
key_includes_history = true

[queue]
max_queue_size = 10
"#
        )
        .unwrap();

        let config = Config::load_with(Some(file.path()), env(&[("MODEL_NAME", "from-env")])).unwrap();
        assert_eq!(config.server.address, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.model.backend, BackendKind::Mock);
        assert_eq!(config.model.model_name, "from-env");
        assert_eq!(config.cache.l2_ttl_secs, 120);
        assert_eq!(config.cache.l1_ttl_secs, 86_400);
        assert!(config.cache.key_includes_history);
        assert_eq!(config.queue.max_queue_size, 10);
    }

    #[test]
    fn test_config_path_from_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[context]\nmax_history_messages = 7").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = Config::load_with(None, env(&[(CONFIG_PATH_ENV, path.as_str())])).unwrap();
        assert_eq!(config.context.max_history_messages, 7);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load_with(Some(Path::new("/nonexistent/sluice.toml")), env(&[]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue\nmax_queue_size = ").unwrap();
        let result = Config::load_with(Some(file.path()), env(&[]));
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
