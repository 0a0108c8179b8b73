//! Queue processor.
//!
//! The single execution driver for the inference backend. One background
//! task dequeues requests in order and streams each one to completion before
//! taking the next, so at most one request is ever dispatched or streaming.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use sluice_abstraction::Model;
use sluice_models::count_tokens;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestrationError, Result};
use crate::queue::{AdmissionQueue, QueuedRequest, RequestState};
use crate::stream::{CancelReason, StreamEvent};

enum Outcome {
    Completed,
    Cancelled(CancelReason),
    Failed(String),
}

/// Background worker that drives queued requests through the backend.
pub struct QueueProcessor {
    queue: Arc<AdmissionQueue>,
    model: Arc<dyn Model + Send + Sync>,
    shutdown: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("model_id", &self.model.model_id())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl QueueProcessor {
    /// Creates a processor over `queue` driving `model`. Call [`start`](Self::start) to run it.
    pub fn new(queue: Arc<AdmissionQueue>, model: Arc<dyn Model + Send + Sync>) -> Self {
        Self {
            queue,
            model,
            shutdown: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Starts the processing loop in a background task.
    ///
    /// # Errors
    /// Returns an error if the processor is already running.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(OrchestrationError::InvalidConfig(
                "Queue processor is already running".to_string(),
            ));
        }

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();

        let queue = Arc::clone(&self.queue);
        let model = Arc::clone(&self.model);
        *handle = Some(tokio::spawn(run(queue, model, shutdown)));
        Ok(())
    }

    /// Whether the processing loop is alive.
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop, cancelling the in-flight request and every queued one.
    pub async fn shutdown(&self) {
        self.shutdown.lock().cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue processor task ended abnormally");
            }
        }
    }
}

async fn run(
    queue: Arc<AdmissionQueue>,
    model: Arc<dyn Model + Send + Sync>,
    shutdown: CancellationToken,
) {
    info!(model_id = %model.model_id(), "Queue processor started");

    loop {
        let request = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            request = queue.dequeue() => request,
        };
        execute(&queue, model.as_ref(), request, &shutdown).await;
    }

    for request in queue.drain_pending() {
        request.cancel_token.cancel();
        let _ = request
            .events
            .try_send(StreamEvent::Cancelled { partial: String::new(), reason: CancelReason::Shutdown });
    }
    info!("Queue processor stopped");
}

async fn execute(
    queue: &AdmissionQueue,
    model: &(dyn Model + Send + Sync),
    request: QueuedRequest,
    shutdown: &CancellationToken,
) {
    let QueuedRequest { id, prompt, parameters, cancel_token, events, submitted_at, .. } = request;
    let dispatched_at = Instant::now();
    debug!(
        request_id = %id,
        waited_ms = dispatched_at.duration_since(submitted_at).as_millis() as u64,
        "Dispatching request"
    );

    if cancel_token.is_cancelled() {
        let reason = queue.cancel_reason(id).unwrap_or(CancelReason::Caller);
        queue.finish(id, RequestState::Cancelled);
        let _ = events.send(StreamEvent::Cancelled { partial: String::new(), reason }).await;
        return;
    }

    let started = tokio::select! {
        biased;
        () = cancel_token.cancelled() => Err(queue.cancel_reason(id).unwrap_or(CancelReason::Caller)),
        () = shutdown.cancelled() => Err(CancelReason::Shutdown),
        started = model.generate_stream(&prompt, Some(parameters)) => Ok(started),
    };

    let mut tokens = match started {
        Ok(Ok(tokens)) => tokens,
        Ok(Err(e)) => {
            error!(request_id = %id, error = %e, "Backend failed to start generation");
            queue.finish(id, RequestState::Failed);
            let _ = events
                .send(StreamEvent::Failed { message: e.to_string(), partial: String::new() })
                .await;
            return;
        }
        Err(reason) => {
            queue.finish(id, RequestState::Cancelled);
            let _ = events.send(StreamEvent::Cancelled { partial: String::new(), reason }).await;
            return;
        }
    };

    queue.mark_streaming(id);
    let mut text = String::new();

    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                break Outcome::Cancelled(queue.cancel_reason(id).unwrap_or(CancelReason::Caller));
            }
            () = shutdown.cancelled() => break Outcome::Cancelled(CancelReason::Shutdown),
            item = tokens.next() => match item {
                Some(Ok(token)) => {
                    text.push_str(&token);
                    tokio::select! {
                        biased;
                        () = cancel_token.cancelled() => {
                            break Outcome::Cancelled(
                                queue.cancel_reason(id).unwrap_or(CancelReason::Caller),
                            );
                        }
                        () = shutdown.cancelled() => break Outcome::Cancelled(CancelReason::Shutdown),
                        sent = events.send(StreamEvent::Token(token)) => {
                            if sent.is_err() {
                                break Outcome::Cancelled(CancelReason::Caller);
                            }
                        }
                    }
                }
                Some(Err(e)) => break Outcome::Failed(e.to_string()),
                None => break Outcome::Completed,
            },
        }
    };
    drop(tokens);

    let generation_ms = dispatched_at.elapsed().as_millis() as u64;
    match outcome {
        Outcome::Completed => {
            let tokens_generated = count_tokens(&text);
            info!(request_id = %id, tokens_generated, generation_ms, "Generation completed");
            queue.finish(id, RequestState::Completed);
            let _ = events.send(StreamEvent::Completed { text, tokens_generated, generation_ms }).await;
        }
        Outcome::Cancelled(reason) => {
            info!(request_id = %id, %reason, partial_len = text.len(), "Generation cancelled");
            if let Err(e) = model.stop().await {
                warn!(request_id = %id, error = %e, "Backend stop request failed");
            }
            queue.finish(id, RequestState::Cancelled);
            let _ = events.send(StreamEvent::Cancelled { partial: text, reason }).await;
        }
        Outcome::Failed(message) => {
            error!(request_id = %id, error = %message, "Generation failed");
            queue.finish(id, RequestState::Failed);
            let _ = events.send(StreamEvent::Failed { message, partial: text }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_abstraction::ModelParameters;
    use sluice_models::MockModel;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request(prompt: &str) -> (QueuedRequest, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (QueuedRequest::new("session", prompt, 1, ModelParameters::default(), tx), rx)
    }

    async fn terminal(rx: &mut mpsc::Receiver<StreamEvent>) -> (Vec<String>, StreamEvent) {
        let mut tokens = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(StreamEvent::Token(t)) => tokens.push(t),
                Some(other) => return (tokens, other),
                None => panic!("channel closed without terminal event"),
            }
        }
    }

    #[tokio::test]
    async fn test_streams_tokens_then_completes() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default().with_response("one two three");
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model.clone()));
        processor.start().unwrap();

        let (req, mut rx) = request("hello");
        queue.enqueue(req).unwrap();
        let (tokens, done) = terminal(&mut rx).await;

        assert_eq!(tokens, vec!["one ", "two ", "three"]);
        match done {
            StreamEvent::Completed { text, tokens_generated, .. } => {
                assert_eq!(text, "one two three");
                assert_eq!(tokens_generated, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(queue.metrics().completed, 1);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatches_in_fifo_order() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default().with_tokens(["x"]);
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model.clone()));

        let mut receivers = Vec::new();
        for prompt in ["A", "B", "C"] {
            let (req, rx) = request(prompt);
            queue.enqueue(req).unwrap();
            receivers.push(rx);
        }
        processor.start().unwrap();
        for rx in &mut receivers {
            terminal(rx).await;
        }

        assert_eq!(model.prompts(), vec!["A", "B", "C"]);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_skips_backend() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default();
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model.clone()));

        let (req, mut rx) = request("never");
        let id = req.id;
        queue.enqueue(req).unwrap();
        queue.cancel(id, CancelReason::Caller);
        processor.start().unwrap();

        let (_, event) = terminal(&mut rx).await;
        assert!(matches!(event, StreamEvent::Cancelled { reason: CancelReason::Caller, .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(model.calls(), 0);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_while_streaming_stops_quickly() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default()
            .with_tokens((0..100).map(|i| format!("t{i} ")))
            .with_token_delay(Duration::from_millis(20));
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model.clone()));
        processor.start().unwrap();

        let (req, mut rx) = request("long");
        let id = req.id;
        queue.enqueue(req).unwrap();

        // Wait for two tokens, then cancel.
        for _ in 0..2 {
            assert!(matches!(rx.recv().await, Some(StreamEvent::Token(_))));
        }
        let cancelled_at = Instant::now();
        queue.cancel(id, CancelReason::Caller);
        let (late_tokens, event) = terminal(&mut rx).await;

        assert!(late_tokens.len() <= 1);
        assert!(cancelled_at.elapsed() < Duration::from_millis(200));
        match event {
            StreamEvent::Cancelled { partial, reason } => {
                assert_eq!(reason, CancelReason::Caller);
                assert!(partial.starts_with("t0 t1 "));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(model.stops(), 1);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_failure_is_terminal() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default().with_tokens(["a", "b", "c"]).failing_after(1);
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model));
        processor.start().unwrap();

        let (req, mut rx) = request("boom");
        queue.enqueue(req).unwrap();
        let (tokens, event) = terminal(&mut rx).await;

        assert_eq!(tokens, vec!["a"]);
        assert!(matches!(event, StreamEvent::Failed { partial, .. } if partial == "a"));
        assert_eq!(queue.metrics().failed, 1);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_refusing_to_start() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default().failing_to_start("connection refused");
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model));
        processor.start().unwrap();

        let (req, mut rx) = request("x");
        queue.enqueue(req).unwrap();
        let (_, event) = terminal(&mut rx).await;

        assert!(matches!(event, StreamEvent::Failed { message, .. } if message.contains("connection refused")));
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_one_request_in_flight() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default()
            .with_tokens(["a", "b", "c"])
            .with_token_delay(Duration::from_millis(10));
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model));
        processor.start().unwrap();

        let mut receivers = Vec::new();
        for i in 0..4 {
            let (req, rx) = request(&format!("p{i}"));
            queue.enqueue(req).unwrap();
            receivers.push(rx);
        }
        for _ in 0..10 {
            assert!(queue.metrics().in_flight <= 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for rx in &mut receivers {
            terminal(rx).await;
        }
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default()
            .with_tokens((0..50).map(|i| format!("t{i}")))
            .with_token_delay(Duration::from_millis(20));
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model));
        processor.start().unwrap();
        assert!(processor.start().is_err());

        let (first, mut rx_first) = request("first");
        let (second, mut rx_second) = request("second");
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();
        assert!(matches!(rx_first.recv().await, Some(StreamEvent::Token(_))));

        processor.shutdown().await;
        assert!(!processor.is_running());

        let (_, event) = terminal(&mut rx_first).await;
        assert!(matches!(event, StreamEvent::Cancelled { reason: CancelReason::Shutdown, .. }));
        let (_, event) = terminal(&mut rx_second).await;
        assert!(matches!(event, StreamEvent::Cancelled { reason: CancelReason::Shutdown, .. }));
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels_generation() {
        let queue = Arc::new(AdmissionQueue::with_capacity(10));
        let model = MockModel::default()
            .with_tokens((0..50).map(|i| format!("t{i}")))
            .with_token_delay(Duration::from_millis(5));
        let processor = QueueProcessor::new(Arc::clone(&queue), Arc::new(model.clone()));
        processor.start().unwrap();

        let (req, rx) = request("gone");
        queue.enqueue(req).unwrap();
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.metrics().cancelled == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(model.stops(), 1);
        processor.shutdown().await;
    }
}
