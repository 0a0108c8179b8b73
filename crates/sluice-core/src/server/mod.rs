//! Server module for Sluice Core.
//!
//! This module contains the HTTP router and the serve loop.

pub mod handlers;
pub mod logging;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use sluice_orchestrator::ModelOrchestrator;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::gateway;
use logging::RequestLoggerLayer;

/// Prefix under which every route is also served.
pub const API_PREFIX: &str = "/api/v1";

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The request pipeline.
    pub orchestrator: Arc<ModelOrchestrator>,
}

impl AppState {
    /// Wraps an orchestrator.
    pub fn new(orchestrator: Arc<ModelOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Builds the HTTP router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/inference/chat", post(handlers::chat))
        .route("/inference/chat/stream", post(handlers::chat_stream))
        .route("/inference/cancel/:request_id", post(handlers::cancel))
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .merge(api.clone())
        .nest(API_PREFIX, api)
        .layer(cors)
        .layer(RequestLoggerLayer)
        .with_state(state)
}

/// Start the Sluice HTTP server and run until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the pipeline cannot be built or the server fails to bind.
pub async fn run(config: &Config) -> Result<()> {
    let orchestrator = Arc::new(gateway::build_orchestrator(config)?);
    let listener = TcpListener::bind(config.server.address).await?;
    serve(listener, orchestrator, shutdown_signal()).await
}

/// Serves on `listener` until `shutdown` resolves, then stops the pipeline.
///
/// # Errors
///
/// Returns an error if the processor cannot start or the server fails.
pub async fn serve<F>(listener: TcpListener, orchestrator: Arc<ModelOrchestrator>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    orchestrator.start()?;
    let addr = listener.local_addr()?;
    info!(%addr, model = %orchestrator.model_id(), "Sluice server started");

    let app = router(AppState::new(Arc::clone(&orchestrator)));
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;

    orchestrator.shutdown().await;
    info!("Sluice server stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
