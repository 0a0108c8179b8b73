//! Model orchestrator.
//!
//! The per-request façade: cache lookup, context assembly, admission, and the
//! relay between the queue processor and the caller. Every chat request ends
//! in exactly one terminal [`ChatEvent`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sluice_abstraction::{ChatMessage, Embedder, Model, ModelParameters};
use sluice_models::{CacheConfig, CacheKey, CacheTier, ExactCache, HashingEmbedder, SemanticCache, count_tokens};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{ContextBuilder, ContextConfig};
use crate::coordinator::{CacheCoordinator, CacheLookup};
use crate::error::{OrchestrationError, Result};
use crate::history::{HistoryStore, InMemoryHistoryStore};
use crate::metrics::{MetricsCollector, MetricsSnapshot, Stage};
use crate::processor::QueueProcessor;
use crate::queue::{AdmissionQueue, CancelOutcome, QueueConfig, QueueMetrics, QueuedRequest};
use crate::stream::{CancelReason, ChatEvent, ChatResponse, ChatStream, StreamEvent};

/// Request-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Wall-clock budget per request in seconds (default: 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Buffered events per request before the processor waits on the caller.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Sampling parameters applied when a request sets none.
    #[serde(default)]
    pub parameters: ModelParameters,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            parameters: ModelParameters::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Request budget as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One chat turn as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation the turn belongs to.
    pub session_id: String,
    /// The user's new message.
    pub prompt: String,
    /// Sampling overrides.
    #[serde(default)]
    pub parameters: Option<ModelParameters>,
    /// History supplied by the caller; replaces the history store lookup.
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
}

impl ChatRequest {
    /// Creates a request with default parameters.
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), prompt: prompt.into(), parameters: None, messages: None }
    }

    /// Sets sampling overrides.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Supplies the conversation history directly.
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = Some(messages);
        self
    }
}

/// Builder for [`ModelOrchestrator`].
pub struct ModelOrchestratorBuilder {
    model: Arc<dyn Model + Send + Sync>,
    embedder: Option<Arc<dyn Embedder + Send + Sync>>,
    history: Option<Arc<dyn HistoryStore>>,
    cache: CacheConfig,
    queue: QueueConfig,
    context: ContextConfig,
    config: OrchestratorConfig,
}

impl ModelOrchestratorBuilder {
    /// Embedder for the semantic tier (default: hashing embedder).
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder + Send + Sync>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Session history store (default: in memory).
    #[must_use]
    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Cache settings.
    #[must_use]
    pub fn cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Queue settings.
    #[must_use]
    pub fn queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Context settings.
    #[must_use]
    pub fn context_config(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Request settings.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the settings and wires the components together.
    ///
    /// The queue processor is created but not started.
    ///
    /// # Errors
    /// Returns an error when any setting is out of range.
    pub fn build(self) -> Result<ModelOrchestrator> {
        self.cache.validate()?;
        if self.queue.max_queue_size == 0 {
            return Err(OrchestrationError::InvalidConfig("max_queue_size must be greater than 0".to_string()));
        }
        if self.config.request_timeout_secs == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.config.channel_capacity < 2 {
            return Err(OrchestrationError::InvalidConfig("channel_capacity must be at least 2".to_string()));
        }
        if self.context.max_context_tokens == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "max_context_tokens must be greater than 0".to_string(),
            ));
        }

        let metrics = Arc::new(MetricsCollector::new());
        let embedder = self.embedder.unwrap_or_else(|| Arc::new(HashingEmbedder::default()));
        let l1 = Arc::new(ExactCache::new(self.cache.l1_max_entries));
        let l2 = Arc::new(SemanticCache::new(embedder, self.cache.similarity_threshold, self.cache.l2_max_entries));
        let coordinator = Arc::new(CacheCoordinator::new(l1, l2, self.cache.clone(), Arc::clone(&metrics)));

        let queue = Arc::new(AdmissionQueue::new(&self.queue));
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::clone(&self.model));
        let history = self.history.unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new()));

        Ok(ModelOrchestrator {
            model_id: self.model.model_id().to_string(),
            queue,
            processor,
            coordinator,
            context: ContextBuilder::new(self.context),
            history,
            metrics,
            cache: self.cache,
            config: self.config,
            background: TaskTracker::new(),
        })
    }
}

/// Composes cache, context, queue and processor into the chat request lifecycle.
pub struct ModelOrchestrator {
    model_id: String,
    queue: Arc<AdmissionQueue>,
    processor: QueueProcessor,
    coordinator: Arc<CacheCoordinator>,
    context: ContextBuilder,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<MetricsCollector>,
    cache: CacheConfig,
    config: OrchestratorConfig,
    background: TaskTracker,
}

impl fmt::Debug for ModelOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelOrchestrator")
            .field("model_id", &self.model_id)
            .field("queue", &self.queue)
            .field("processor", &self.processor)
            .finish_non_exhaustive()
    }
}

impl ModelOrchestrator {
    /// Starts building an orchestrator around `model`.
    pub fn builder(model: Arc<dyn Model + Send + Sync>) -> ModelOrchestratorBuilder {
        ModelOrchestratorBuilder {
            model,
            embedder: None,
            history: None,
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            context: ContextConfig::default(),
            config: OrchestratorConfig::default(),
        }
    }

    /// Starts the queue processor.
    ///
    /// # Errors
    /// Returns an error if it is already running.
    pub fn start(&self) -> Result<()> {
        self.processor.start()?;
        info!(model_id = %self.model_id, capacity = self.queue.capacity(), "Model orchestrator started");
        Ok(())
    }

    /// Stops the processor, lets every open request reach its terminal event
    /// and waits for pending cache and history writes.
    pub async fn shutdown(&self) {
        self.processor.shutdown().await;
        self.settle().await;
        info!("Model orchestrator stopped");
    }

    /// Whether the queue processor is alive.
    pub fn processor_running(&self) -> bool {
        self.processor.is_running()
    }

    /// Waits until every relay, history write and L2 write started so far has finished.
    pub async fn settle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
        self.coordinator.settle().await;
    }

    /// Cancels a queued or in-flight request on behalf of its caller.
    pub fn cancel(&self, request_id: Uuid) -> CancelOutcome {
        let outcome = self.queue.cancel(request_id, CancelReason::Caller);
        debug!(request_id = %request_id, ?outcome, "Cancel requested");
        outcome
    }

    /// Current metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.queue.len())
    }

    /// Admission queue counters.
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Requests waiting for the backend.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Backend model identifier.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The cache tiers.
    pub fn caches(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    /// Handles one chat request and returns its event stream.
    ///
    /// Cache hits complete immediately without touching the queue. Misses
    /// are admitted to the queue and relayed token by token. Dropping the
    /// returned stream cancels the request.
    ///
    /// # Errors
    /// `InvalidRequest` for an empty prompt or session, `ProcessorUnavailable`
    /// on a cache miss while the processor is stopped, `ServiceOverloaded`
    /// when the queue is full.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatStream> {
        let started = Instant::now();
        if request.prompt.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest("prompt must not be empty".to_string()));
        }
        if request.session_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest("session_id must not be empty".to_string()));
        }

        self.metrics.record_request();
        let parameters = match &request.parameters {
            Some(overrides) => self.config.parameters.clone().merged_with(overrides),
            None => self.config.parameters.clone(),
        };

        let mut history = None;
        if self.cache.key_includes_history {
            history = Some(self.session_history(&request).await);
        }
        let key =
            CacheKey::new(&request.prompt, self.scope_hash(&request.session_id, &parameters, history.as_deref()));

        if let CacheLookup::Hit { tier, entry, similarity } = self.coordinator.lookup(&key).await {
            return Ok(self.serve_hit(&request, tier, entry.response, similarity, started));
        }

        self.metrics.record_cache_miss();
        debug!(session_id = %request.session_id, "Cache miss");
        if !self.processor.is_running() {
            return Err(OrchestrationError::ProcessorUnavailable);
        }
        let history = match history {
            Some(history) => history,
            None => self.session_history(&request).await,
        };
        let window = self.context.build(&history, &request.prompt);

        let (upstream_tx, upstream_rx) = mpsc::channel(self.config.channel_capacity);
        let queued =
            QueuedRequest::new(&request.session_id, window.render(), window.total_tokens, parameters, upstream_tx);
        let request_id = queued.id;
        let ahead = match self.queue.enqueue(queued) {
            Ok(ahead) => ahead,
            Err(e) => {
                self.metrics.record_rejected();
                return Err(e);
            }
        };
        info!(
            request_id = %request_id,
            session_id = %request.session_id,
            tokens_prompt = window.total_tokens,
            ahead,
            "Request queued"
        );

        let (downstream_tx, downstream_rx) = mpsc::channel(self.config.channel_capacity);
        let relay = Relay {
            request_id,
            session_id: request.session_id,
            prompt: request.prompt,
            key,
            tokens_prompt: window.total_tokens,
            model_id: self.model_id.clone(),
            started,
            deadline: started.checked_add(self.config.request_timeout()).unwrap_or_else(|| far_future(started)),
            queue: Arc::clone(&self.queue),
            coordinator: Arc::clone(&self.coordinator),
            history: Arc::clone(&self.history),
            metrics: Arc::clone(&self.metrics),
            background: self.background.clone(),
        };
        self.background.spawn(relay.run(upstream_rx, downstream_tx));

        Ok(ChatStream::new(request_id, downstream_rx))
    }

    /// Handles a request and buffers the whole response.
    ///
    /// # Errors
    /// Everything [`handle`](Self::handle) returns, plus `GenerationFailed`
    /// and `Cancelled` when the request does not complete.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.handle(request).await?.collect_response().await
    }

    fn serve_hit(
        &self,
        request: &ChatRequest,
        tier: CacheTier,
        response: String,
        similarity: Option<f32>,
        started: Instant,
    ) -> ChatStream {
        self.metrics.record_cache_hit(tier);
        let request_id = Uuid::new_v4();
        let tokens_generated = count_tokens(&response);
        let tokens_prompt = count_tokens(&request.prompt);
        let latency = started.elapsed();
        self.metrics.record_completion(tokens_generated, tokens_prompt, latency);
        info!(
            request_id = %request_id,
            session_id = %request.session_id,
            cache_type = %tier,
            latency_ms = latency.as_millis() as u64,
            "Served from cache"
        );

        persist_exchange(&self.background, &self.history, &request.session_id, &request.prompt, &response);

        let (tx, rx) = mpsc::channel(2);
        let done = ChatResponse {
            request_id,
            session_id: request.session_id.clone(),
            response: response.clone(),
            tokens_generated,
            tokens_prompt,
            latency_ms: latency.as_millis() as u64,
            cache_hit: true,
            cache_type: Some(tier),
            similarity,
            model: self.model_id.clone(),
        };
        // Capacity 2 holds both events.
        let _ = tx.try_send(ChatEvent::Token(response));
        let _ = tx.try_send(ChatEvent::Done(done));
        ChatStream::new(request_id, rx)
    }

    async fn session_history(&self, request: &ChatRequest) -> Vec<ChatMessage> {
        if let Some(messages) = &request.messages {
            return messages.clone();
        }
        let limit = self.context.config().max_history_messages;
        match self.history.load_history(&request.session_id, limit).await {
            Ok(history) => history,
            Err(e) => {
                warn!(session_id = %request.session_id, error = %e, "History unavailable, using prompt only");
                Vec::new()
            }
        }
    }

    /// Answers are only reused within the session that produced them.
    fn scope_hash(&self, session_id: &str, parameters: &ModelParameters, history: Option<&[ChatMessage]>) -> String {
        let parameters = serde_json::to_string(parameters).unwrap_or_default();
        let mut parts = vec![
            session_id.to_string(),
            self.context.config().system_prompt.clone(),
            self.model_id.clone(),
            parameters,
        ];
        if let Some(history) = history {
            parts.extend(history.iter().map(|m| format!("{}: {}", m.role, m.content)));
        }
        CacheKey::hash_context(parts)
    }
}

/// Deadline used when the configured budget does not fit in an `Instant`.
fn far_future(started: Instant) -> Instant {
    const THIRTY_YEARS: Duration = Duration::from_secs(86_400 * 365 * 30);
    started.checked_add(THIRTY_YEARS).unwrap_or(started)
}

fn persist_exchange(
    background: &TaskTracker,
    history: &Arc<dyn HistoryStore>,
    session_id: &str,
    prompt: &str,
    response: &str,
) {
    let history = Arc::clone(history);
    let session_id = session_id.to_string();
    let messages = [ChatMessage::user(prompt), ChatMessage::assistant(response)];
    background.spawn(async move {
        for message in messages {
            if let Err(e) = history.append_message(&session_id, message).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist message");
                return;
            }
        }
    });
}

/// Moves one request's events from the processor to its caller.
struct Relay {
    request_id: Uuid,
    session_id: String,
    prompt: String,
    key: CacheKey,
    tokens_prompt: u32,
    model_id: String,
    started: Instant,
    deadline: Instant,
    queue: Arc<AdmissionQueue>,
    coordinator: Arc<CacheCoordinator>,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<MetricsCollector>,
    background: TaskTracker,
}

impl Relay {
    async fn run(self, mut upstream: mpsc::Receiver<StreamEvent>, downstream: mpsc::Sender<ChatEvent>) {
        let deadline = tokio::time::sleep_until(self.deadline.into());
        tokio::pin!(deadline);
        let mut caller_gone = false;
        let mut timed_out = false;

        let terminal = loop {
            let event = tokio::select! {
                biased;
                () = downstream.closed(), if !caller_gone => {
                    caller_gone = true;
                    self.queue.cancel(self.request_id, CancelReason::Caller);
                    continue;
                }
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(request_id = %self.request_id, "Request timed out");
                    self.queue.cancel(self.request_id, CancelReason::Timeout);
                    continue;
                }
                event = upstream.recv() => event,
            };

            match event {
                Some(StreamEvent::Token(token)) => {
                    if caller_gone {
                        continue;
                    }
                    tokio::select! {
                        biased;
                        () = &mut deadline, if !timed_out => {
                            timed_out = true;
                            warn!(request_id = %self.request_id, "Request timed out");
                            self.queue.cancel(self.request_id, CancelReason::Timeout);
                        }
                        sent = downstream.send(ChatEvent::Token(token)) => {
                            if sent.is_err() {
                                caller_gone = true;
                                self.queue.cancel(self.request_id, CancelReason::Caller);
                            }
                        }
                    }
                }
                Some(event) => break Some(event),
                None => break None,
            }
        };

        let outcome = match terminal {
            Some(StreamEvent::Completed { text, tokens_generated, generation_ms }) => {
                self.complete(text, tokens_generated, generation_ms)
            }
            Some(StreamEvent::Cancelled { partial, reason }) => {
                self.metrics.record_cancelled();
                info!(request_id = %self.request_id, %reason, partial_len = partial.len(), "Request cancelled");
                ChatEvent::Cancelled { reason, partial }
            }
            Some(StreamEvent::Failed { message, .. }) => {
                self.metrics.record_error();
                error!(request_id = %self.request_id, error = %message, "Request failed");
                ChatEvent::Failed { message }
            }
            Some(StreamEvent::Token(_)) | None => {
                self.metrics.record_error();
                error!(request_id = %self.request_id, "Processor dropped the request");
                ChatEvent::Failed { message: "generation ended without a result".to_string() }
            }
        };

        if !caller_gone {
            let _ = downstream.send(outcome).await;
        }
    }

    fn complete(&self, text: String, tokens_generated: u32, generation_ms: u64) -> ChatEvent {
        self.coordinator.write_through(self.key.clone(), &text);
        persist_exchange(&self.background, &self.history, &self.session_id, &self.prompt, &text);

        let latency = self.started.elapsed();
        self.metrics.record_latency(Stage::Model, Duration::from_millis(generation_ms));
        self.metrics.record_completion(tokens_generated, self.tokens_prompt, latency);
        info!(
            request_id = %self.request_id,
            session_id = %self.session_id,
            tokens_generated,
            latency_ms = latency.as_millis() as u64,
            "Request completed"
        );

        ChatEvent::Done(ChatResponse {
            request_id: self.request_id,
            session_id: self.session_id.clone(),
            response: text,
            tokens_generated,
            tokens_prompt: self.tokens_prompt,
            latency_ms: latency.as_millis() as u64,
            cache_hit: false,
            cache_type: None,
            similarity: None,
            model: self.model_id.clone(),
        })
    }
}
