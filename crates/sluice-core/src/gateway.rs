//! Builds the request pipeline from configuration.

use std::sync::Arc;

use sluice_abstraction::Model;
use sluice_models::ModelFactory;
use sluice_orchestrator::{HistoryStore, InMemoryHistoryStore, JsonlHistoryStore, ModelOrchestrator};
use tracing::info;

use crate::config::{Config, HistoryBackend};
use crate::error::Result;

/// Creates the configured backend and wires the orchestrator around it.
///
/// The queue processor is not started.
///
/// # Errors
/// Returns an error if the backend cannot be created or a setting is invalid.
pub fn build_orchestrator(config: &Config) -> Result<ModelOrchestrator> {
    let model = ModelFactory::create(&config.model)?;
    build_with_model(config, model)
}

/// Wires the orchestrator around an already constructed backend.
///
/// # Errors
/// Returns an error if a setting is invalid.
pub fn build_with_model(config: &Config, model: Arc<dyn Model + Send + Sync>) -> Result<ModelOrchestrator> {
    let embedder = ModelFactory::create_embedder(&config.embeddings, &config.model.base_url);
    let history: Arc<dyn HistoryStore> = match config.history.backend {
        HistoryBackend::Memory => Arc::new(InMemoryHistoryStore::new()),
        HistoryBackend::Jsonl => Arc::new(JsonlHistoryStore::new(&config.history.dir)),
    };
    info!(
        backend = ?config.model.backend,
        model = %config.model.model_name,
        embeddings = ?config.embeddings.provider,
        history = ?config.history.backend,
        "Building request pipeline"
    );

    let orchestrator = ModelOrchestrator::builder(model)
        .embedder(embedder)
        .history(history)
        .cache_config(config.cache.clone())
        .queue_config(config.queue.clone())
        .context_config(config.context.clone())
        .config(config.request.clone())
        .build()?;
    Ok(orchestrator)
}
