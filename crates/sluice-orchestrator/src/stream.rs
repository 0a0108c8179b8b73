//! Token stream types.
//!
//! The queue processor reports each request's progress as [`StreamEvent`]s on
//! a private channel. The orchestrator relays them to the caller as
//! [`ChatEvent`]s through a [`ChatStream`], which both the SSE writer and the
//! buffering writer consume.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use sluice_models::CacheTier;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};

/// Why a generation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    /// The caller asked for it or went away.
    Caller,
    /// The request exceeded its wall-clock budget.
    Timeout,
    /// The processor is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Caller => "caller",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Progress of one request as reported by the queue processor.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One generated token.
    Token(String),
    /// Generation finished normally.
    Completed {
        /// Full generated text.
        text: String,
        /// Token count of `text`.
        tokens_generated: u32,
        /// Time from dispatch to the last token.
        generation_ms: u64,
    },
    /// Generation stopped early.
    Cancelled {
        /// Text produced before the stop.
        partial: String,
        /// Why it stopped.
        reason: CancelReason,
    },
    /// The backend failed.
    Failed {
        /// Backend error message.
        message: String,
        /// Text produced before the failure.
        partial: String,
    },
}

/// Final summary of a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Request identifier.
    pub request_id: Uuid,
    /// Session the request belongs to.
    pub session_id: String,
    /// Full response text.
    pub response: String,
    /// Token count of the response.
    pub tokens_generated: u32,
    /// Token count of what was sent to the backend (the prompt alone on a cache hit).
    pub tokens_prompt: u32,
    /// Wall-clock time from request entry to completion.
    pub latency_ms: u64,
    /// Whether a cache tier served the response.
    pub cache_hit: bool,
    /// Which tier served it.
    pub cache_type: Option<CacheTier>,
    /// Similarity of a semantic hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    /// Backend model identifier.
    pub model: String,
}

/// What a caller sees on a [`ChatStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// One generated token (the whole response on a cache hit).
    Token(String),
    /// Terminal: the request completed.
    Done(ChatResponse),
    /// Terminal: the request was cancelled; `partial` is what was streamed.
    Cancelled {
        /// Why it stopped.
        reason: CancelReason,
        /// Text streamed before the stop.
        partial: String,
    },
    /// Terminal: the backend failed.
    Failed {
        /// Error message.
        message: String,
    },
}

impl ChatEvent {
    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// A cancellable, lazy sequence of [`ChatEvent`]s for one request.
///
/// Dropping the stream cancels the request.
#[derive(Debug)]
pub struct ChatStream {
    request_id: Uuid,
    events: mpsc::Receiver<ChatEvent>,
}

impl ChatStream {
    pub(crate) fn new(request_id: Uuid, events: mpsc::Receiver<ChatEvent>) -> Self {
        Self { request_id, events }
    }

    /// Identifier usable with `ModelOrchestrator::cancel`.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Waits for the next event.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    /// Drains the stream into a single response.
    ///
    /// # Errors
    /// Returns `GenerationFailed` or `Cancelled` when the request did not complete.
    pub async fn collect_response(mut self) -> Result<ChatResponse> {
        while let Some(event) = self.events.recv().await {
            match event {
                ChatEvent::Token(_) => {}
                ChatEvent::Done(response) => return Ok(response),
                ChatEvent::Cancelled { reason, partial } => {
                    return Err(OrchestrationError::Cancelled { reason, partial });
                }
                ChatEvent::Failed { message } => {
                    return Err(OrchestrationError::GenerationFailed(message));
                }
            }
        }
        Err(OrchestrationError::GenerationFailed("stream ended without a result".to_string()))
    }
}

impl Stream for ChatStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
