//! Sluice Core - HTTP gateway in front of a single local model backend.
//!
//! This crate wires the request pipeline from configuration and serves it:
//! - HTTP routes for buffered and streaming chat, cancellation and metrics
//! - Configuration management
//! - Error handling
//!
//! # Example
//!
//! ```rust,no_run
//! use sluice_core::{config::Config, server};
//!
//! #[tokio::main]
//! async fn main() -> sluice_core::error::Result<()> {
//!     let config = Config::load(None)?;
//!     server::run(&config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod server;

pub use config::{Config, ConfigError, HistoryBackend, LogFormat};
pub use error::{ApiError, GatewayError, Result};
pub use gateway::{build_orchestrator, build_with_model};
pub use server::{AppState, router};
