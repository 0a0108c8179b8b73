//! Request orchestration for Sluice.
//!
//! Many concurrent chat requests share one slow inference backend. This crate
//! puts a two-tier response cache in front of it, a bounded FIFO admission
//! queue before it, and a single queue processor that streams one request at
//! a time. The [`ModelOrchestrator`] ties these together per request.

pub mod context;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod queue;
pub mod stream;

pub use context::{ContextBuilder, ContextConfig, ContextMessage, ContextWindow, DEFAULT_SYSTEM_PROMPT};
pub use coordinator::{CacheCoordinator, CacheLookup};
pub use error::{OrchestrationError, Result};
pub use history::{HistoryError, HistoryStore, InMemoryHistoryStore, JsonlHistoryStore};
pub use metrics::{HistogramBucket, MetricsCollector, MetricsSnapshot, Stage};
pub use orchestrator::{ChatRequest, ModelOrchestrator, ModelOrchestratorBuilder, OrchestratorConfig};
pub use processor::QueueProcessor;
pub use queue::{AdmissionQueue, CancelOutcome, QueueConfig, QueueMetrics, QueuedRequest, RequestState};
pub use stream::{CancelReason, ChatEvent, ChatResponse, ChatStream, StreamEvent};
