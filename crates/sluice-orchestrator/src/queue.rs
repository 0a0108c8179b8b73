//! Admission queue.
//!
//! A bounded FIFO in front of the single inference slot. Admission never
//! waits: a full queue rejects immediately so callers can back off. The queue
//! also remembers which request is in flight so a cancellation can be routed
//! either to removal (still queued) or to the request's cancel token
//! (already dispatched).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_abstraction::ModelParameters;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};
use crate::stream::{CancelReason, StreamEvent};

/// Admission queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of requests waiting for the inference slot (default: 50).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_queue_size() -> usize {
    50
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_queue_size: default_max_queue_size() }
    }
}

/// Lifecycle of a request inside the inference pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Waiting in the queue.
    Queued,
    /// Taken by the processor, backend not yet streaming.
    Dispatched,
    /// Backend is producing tokens.
    Streaming,
    /// Finished normally.
    Completed,
    /// Stopped by cancellation or timeout.
    Cancelled,
    /// Turned away at admission.
    Rejected,
    /// Backend error.
    Failed,
}

/// A request admitted to the queue.
#[derive(Debug)]
pub struct QueuedRequest {
    /// Unique request identifier.
    pub id: Uuid,
    /// Session the request belongs to.
    pub session_id: String,
    /// Rendered context sent to the backend.
    pub prompt: String,
    /// Token count of `prompt`.
    pub context_tokens: u32,
    /// Sampling parameters.
    pub parameters: ModelParameters,
    /// When the request was admitted.
    pub submitted_at: Instant,
    /// FIFO rank, assigned at admission.
    pub position: u64,
    /// Signalled to stop generation early.
    pub cancel_token: CancellationToken,
    /// Where the processor reports progress.
    pub events: mpsc::Sender<StreamEvent>,
}

impl QueuedRequest {
    /// Creates a request; `position` is assigned on admission.
    pub fn new(
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        context_tokens: u32,
        parameters: ModelParameters,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            prompt: prompt.into(),
            context_tokens,
            parameters,
            submitted_at: Instant::now(),
            position: 0,
            cancel_token: CancellationToken::new(),
            events,
        }
    }
}

/// Result of [`AdmissionQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was still queued and has been removed.
    RemovedFromQueue,
    /// The request was in flight; its cancel token has been signalled.
    SignalledInFlight,
    /// No live request with that id.
    NotFound,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    /// Requests currently waiting.
    pub pending: usize,
    /// Requests dispatched and not yet finished (0 or 1).
    pub in_flight: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Requests admitted since start.
    pub accepted: u64,
    /// Requests turned away since start.
    pub rejected: u64,
    /// Requests that finished normally.
    pub completed: u64,
    /// Requests cancelled, queued or in flight.
    pub cancelled: u64,
    /// Requests whose generation failed.
    pub failed: u64,
}

struct InFlight {
    token: CancellationToken,
    state: RequestState,
    reason: Option<CancelReason>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedRequest>,
    in_flight: HashMap<Uuid, InFlight>,
    next_position: u64,
    accepted: u64,
    rejected: u64,
    completed: u64,
    cancelled: u64,
    failed: u64,
}

/// Bounded FIFO queue serializing access to the inference backend.
///
/// Any number of producers may call [`enqueue`](Self::enqueue); exactly one
/// consumer, the queue processor, calls [`dequeue`](Self::dequeue).
pub struct AdmissionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Notify,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("capacity", &self.capacity)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl AdmissionQueue {
    /// Creates a queue from configuration.
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_capacity(config.max_queue_size)
    }

    /// Creates a queue holding at most `capacity` pending requests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, state: Mutex::new(QueueState::default()), available: Notify::new() }
    }

    /// Admits `request` or rejects it immediately when the queue is full.
    ///
    /// Returns the number of requests ahead of it.
    ///
    /// # Errors
    /// Returns `ServiceOverloaded` when `capacity` requests are already pending.
    pub fn enqueue(&self, mut request: QueuedRequest) -> Result<usize> {
        let mut state = self.state.lock();
        if state.pending.len() >= self.capacity {
            state.rejected += 1;
            warn!(
                request_id = %request.id,
                queue_length = state.pending.len(),
                capacity = self.capacity,
                "Admission queue full, rejecting request"
            );
            return Err(OrchestrationError::ServiceOverloaded { capacity: self.capacity });
        }

        request.position = state.next_position;
        state.next_position += 1;
        state.accepted += 1;
        let ahead = state.pending.len() + state.in_flight.len();
        debug!(
            request_id = %request.id,
            session_id = %request.session_id,
            position = request.position,
            ahead,
            "Request admitted"
        );
        state.pending.push_back(request);
        drop(state);

        self.available.notify_one();
        Ok(ahead)
    }

    /// Takes the oldest pending request without waiting.
    pub fn try_dequeue(&self) -> Option<QueuedRequest> {
        let mut state = self.state.lock();
        let request = state.pending.pop_front()?;
        state.in_flight.insert(
            request.id,
            InFlight {
                token: request.cancel_token.clone(),
                state: RequestState::Dispatched,
                reason: None,
            },
        );
        debug!(request_id = %request.id, remaining = state.pending.len(), "Request dispatched");
        Some(request)
    }

    /// Waits for and takes the oldest pending request.
    ///
    /// Cancel safe: a request is only removed when this future completes.
    pub async fn dequeue(&self) -> QueuedRequest {
        loop {
            if let Some(request) = self.try_dequeue() {
                return request;
            }
            self.available.notified().await;
        }
    }

    /// Cancels a request wherever it is.
    pub fn cancel(&self, id: Uuid, reason: CancelReason) -> CancelOutcome {
        let mut state = self.state.lock();

        if let Some(index) = state.pending.iter().position(|r| r.id == id) {
            let request = state.pending.remove(index);
            state.cancelled += 1;
            drop(state);

            if let Some(request) = request {
                request.cancel_token.cancel();
                // The channel is fresh: nothing else has been sent on it yet.
                let _ = request
                    .events
                    .try_send(StreamEvent::Cancelled { partial: String::new(), reason });
                debug!(request_id = %id, %reason, "Removed queued request");
            }
            return CancelOutcome::RemovedFromQueue;
        }

        if let Some(in_flight) = state.in_flight.get_mut(&id) {
            if in_flight.reason.is_none() {
                in_flight.reason = Some(reason);
            }
            in_flight.token.cancel();
            debug!(request_id = %id, %reason, "Signalled in-flight request");
            return CancelOutcome::SignalledInFlight;
        }

        CancelOutcome::NotFound
    }

    /// Why an in-flight request was cancelled, if it was.
    pub fn cancel_reason(&self, id: Uuid) -> Option<CancelReason> {
        self.state.lock().in_flight.get(&id).and_then(|f| f.reason)
    }

    /// Records that the backend started streaming for `id`.
    pub fn mark_streaming(&self, id: Uuid) {
        if let Some(in_flight) = self.state.lock().in_flight.get_mut(&id) {
            in_flight.state = RequestState::Streaming;
        }
    }

    /// Records the terminal state of a dispatched request and forgets it.
    pub fn finish(&self, id: Uuid, outcome: RequestState) {
        let mut state = self.state.lock();
        if state.in_flight.remove(&id).is_none() {
            return;
        }
        match outcome {
            RequestState::Completed => state.completed += 1,
            RequestState::Cancelled => state.cancelled += 1,
            RequestState::Failed => state.failed += 1,
            other => warn!(request_id = %id, state = ?other, "Non-terminal state passed to finish"),
        }
    }

    /// Current state of a live request.
    pub fn state_of(&self, id: Uuid) -> Option<RequestState> {
        let state = self.state.lock();
        if state.pending.iter().any(|r| r.id == id) {
            return Some(RequestState::Queued);
        }
        state.in_flight.get(&id).map(|f| f.state)
    }

    /// Removes every pending request, oldest first.
    pub fn drain_pending(&self) -> Vec<QueuedRequest> {
        let mut state = self.state.lock();
        let drained: Vec<QueuedRequest> = state.pending.drain(..).collect();
        state.cancelled += drained.len() as u64;
        drained
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock();
        QueueMetrics {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            capacity: self.capacity,
            accepted: state.accepted,
            rejected: state.rejected,
            completed: state.completed,
            cancelled: state.cancelled,
            failed: state.failed,
        }
    }
}
