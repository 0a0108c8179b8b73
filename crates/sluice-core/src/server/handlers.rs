//! HTTP handlers.
//!
//! The buffered and streaming chat routes drive the same [`ChatStream`]; they
//! differ only in how its events are written out.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sluice_abstraction::{ChatMessage, ModelParameters};
use sluice_orchestrator::{CancelOutcome, ChatEvent, ChatRequest, ChatResponse, MetricsSnapshot};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::error::ApiError;

/// Sampling options as sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InferenceOptions {
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling mass.
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Generation cap.
    #[serde(default, alias = "num_predict", alias = "max_new_tokens")]
    pub max_tokens: Option<u32>,
    /// Stop sequences.
    #[serde(default, alias = "stop_sequences")]
    pub stop: Option<Vec<String>>,
}

/// Body of both chat routes.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    /// Conversation identifier.
    pub session_id: String,
    /// The new user message.
    pub prompt: String,
    /// Accepted for compatibility; the route decides whether to stream.
    #[serde(default)]
    pub stream: Option<bool>,
    /// Sampling options, also accepted as `config` or `model_settings`.
    #[serde(default, alias = "config", alias = "model_settings")]
    pub options: Option<InferenceOptions>,
    /// Shorthand for `options.temperature`.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Shorthand for `options.max_tokens`.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Conversation history to use instead of the stored one.
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
}

impl InferenceRequest {
    /// Folds the aliases and shorthands into one orchestrator request.
    ///
    /// Values inside `options` win over the top-level shorthands.
    pub fn into_chat_request(self) -> ChatRequest {
        let options = self.options.unwrap_or_default();
        let parameters = ModelParameters {
            temperature: options.temperature.or(self.temperature),
            top_p: options.top_p,
            max_tokens: options.max_tokens.or(self.max_tokens),
            stop_sequences: options.stop,
        };
        let has_overrides = parameters.temperature.is_some()
            || parameters.top_p.is_some()
            || parameters.max_tokens.is_some()
            || parameters.stop_sequences.is_some();

        let mut request = ChatRequest::new(self.session_id, self.prompt);
        if has_overrides {
            request = request.with_parameters(parameters);
        }
        if let Some(messages) = self.messages {
            request = request.with_messages(messages);
        }
        request
    }
}

/// `GET /health` body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" while the processor runs, otherwise "degraded".
    pub status: &'static str,
    /// Backend model identifier.
    pub model: String,
    /// Requests waiting for the backend.
    pub queue_length: usize,
    /// Whether requests are being processed.
    pub processor_running: bool,
}

/// `POST /inference/chat`: runs the request and returns the whole response.
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<InferenceRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let response = state.orchestrator.chat(body.into_chat_request()).await?;
    Ok(Json(response))
}

/// `POST /inference/chat/stream`: relays tokens as Server-Sent Events.
///
/// Admission failures are returned as plain HTTP errors before the stream
/// opens. Closing the connection cancels the request.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<InferenceRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state.orchestrator.handle(body.into_chat_request()).await?;
    let request_id = stream.request_id();
    debug!(request_id = %request_id, "Opening event stream");

    let events = stream.map(move |event| Ok(Event::default().data(sse_payload(request_id, &event).to_string())));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// JSON carried by one SSE event.
pub fn sse_payload(request_id: Uuid, event: &ChatEvent) -> Value {
    match event {
        ChatEvent::Token(token) => json!({ "token": token, "done": false }),
        ChatEvent::Done(response) => json!({
            "token": "",
            "done": true,
            "request_id": request_id,
            "tokens_generated": response.tokens_generated,
            "tokens_prompt": response.tokens_prompt,
            "latency_ms": response.latency_ms,
            "cache_hit": response.cache_hit,
            "cache_type": response.cache_type,
        }),
        ChatEvent::Cancelled { reason, .. } => json!({
            "token": "",
            "done": true,
            "request_id": request_id,
            "cancelled": true,
            "reason": reason,
        }),
        ChatEvent::Failed { message } => json!({
            "token": "",
            "done": true,
            "request_id": request_id,
            "error": message,
        }),
    }
}

/// `POST /inference/cancel/:request_id`.
pub async fn cancel(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let status = match state.orchestrator.cancel(request_id) {
        CancelOutcome::RemovedFromQueue => "removed_from_queue",
        CancelOutcome::SignalledInFlight => "stopping",
        CancelOutcome::NotFound => {
            return Err(ApiError::not_found(format!("No active request {request_id}")));
        }
    };
    Ok(Json(json!({ "request_id": request_id, "status": status })))
}

/// `GET /metrics`.
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics_snapshot())
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let processor_running = state.orchestrator.processor_running();
    Json(HealthResponse {
        status: if processor_running { "healthy" } else { "degraded" },
        model: state.orchestrator.model_id().to_string(),
        queue_length: state.orchestrator.queue_len(),
        processor_running,
    })
}

/// `GET /`.
pub async fn root() -> Json<Value> {
    Json(json!({ "name": "sluice", "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_models::CacheTier;
    use sluice_orchestrator::CancelReason;

    fn parse(body: &str) -> InferenceRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_minimal_request_has_no_overrides() {
        let request = parse(r#"{"session_id": "s", "prompt": "hi"}"#).into_chat_request();
        assert_eq!(request.parameters, None);
        assert_eq!(request.messages, None);
    }

    #[test]
    fn test_model_settings_alias() {
        let request =
            parse(r#"{"session_id": "s", "prompt": "hi", "model_settings": {"temperature": 0.2, "num_predict": 64}}"#)
                .into_chat_request();
        let parameters = request.parameters.unwrap();
        assert_eq!(parameters.temperature, Some(0.2));
        assert_eq!(parameters.max_tokens, Some(64));
    }

    #[test]
    fn test_config_alias_wins_over_shorthand() {
        let request = parse(
            r#"{"session_id": "s", "prompt": "hi", "stream": false, "config": {"max_tokens": 10}, "max_tokens": 99, "temperature": 0.1}"#,
        )
        .into_chat_request();
        let parameters = request.parameters.unwrap();
        assert_eq!(parameters.max_tokens, Some(10));
        assert_eq!(parameters.temperature, Some(0.1));
    }

    #[test]
    fn test_messages_pass_through() {
        let request = parse(
            r#"{"session_id": "s", "prompt": "hi", "messages": [{"role": "user", "content": "earlier"}]}"#,
        )
        .into_chat_request();
        assert_eq!(request.messages, Some(vec![ChatMessage::user("earlier")]));
    }

    #[test]
    fn test_sse_payloads() {
        let id = Uuid::new_v4();
        assert_eq!(sse_payload(id, &ChatEvent::Token("a".to_string())), json!({"token": "a", "done": false}));

        let done = ChatResponse {
            request_id: id,
            session_id: "s".to_string(),
            response: "abc".to_string(),
            tokens_generated: 1,
            tokens_prompt: 2,
            latency_ms: 3,
            cache_hit: true,
            cache_type: Some(CacheTier::L1),
            similarity: None,
            model: "mock".to_string(),
        };
        let payload = sse_payload(id, &ChatEvent::Done(done));
        assert_eq!(payload["done"], true);
        assert_eq!(payload["cache_type"], "l1");
        assert_eq!(payload["request_id"], id.to_string());

        let payload =
            sse_payload(id, &ChatEvent::Cancelled { reason: CancelReason::Timeout, partial: String::new() });
        assert_eq!(payload["reason"], "timeout");

        let payload = sse_payload(id, &ChatEvent::Failed { message: "boom".to_string() });
        assert_eq!(payload["error"], "boom");
    }
}
