//! HTTP-level tests for the gateway routes, driven through the router with
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use serde_json::{Value, json};
use sluice_core::config::Config;
use sluice_core::server::logging::REQUEST_ID_HEADER;
use sluice_core::{AppState, build_with_model, router};
use sluice_models::MockModel;
use sluice_orchestrator::{ChatRequest, ModelOrchestrator};
use tower::ServiceExt;

fn started(config: &Config, model: &MockModel) -> Arc<ModelOrchestrator> {
    let orchestrator = build_with_model(config, Arc::new(model.clone())).unwrap();
    orchestrator.start().unwrap();
    Arc::new(orchestrator)
}

async fn send(orchestrator: &Arc<ModelOrchestrator>, request: Request<Body>) -> Response {
    router(AppState::new(Arc::clone(orchestrator))).oneshot(request).await.unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_chat_miss_then_hit() {
    let model = MockModel::default().with_response("Rust is a systems language.");
    let orchestrator = started(&Config::default(), &model);
    let body = json!({"session_id": "s1", "prompt": "What is Rust?"});

    let response = send(&orchestrator, post_json("/inference/chat", &body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let first = body_json(response).await;
    assert_eq!(first["response"], "Rust is a systems language.");
    assert_eq!(first["cache_hit"], false);
    assert_eq!(first["cache_type"], Value::Null);

    let second = body_json(send(&orchestrator, post_json("/inference/chat", &body)).await).await;
    assert_eq!(second["cache_hit"], true);
    assert_eq!(second["cache_type"], "l1");
    assert_eq!(second["response"], first["response"]);
    assert_ne!(second["request_id"], first["request_id"]);
    assert_eq!(model.calls(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stream_emits_tokens_then_done() {
    let model = MockModel::default().with_tokens(["Hello", " world"]);
    let orchestrator = started(&Config::default(), &model);

    let response =
        send(&orchestrator, post_json("/inference/chat/stream", &json!({"session_id": "s", "prompt": "hi"}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let text = body_text(response).await;
    let events: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], json!({"token": "Hello", "done": false}));
    assert_eq!(events[1], json!({"token": " world", "done": false}));
    assert_eq!(events[2]["done"], true);
    assert_eq!(events[2]["cache_hit"], false);
    assert_eq!(events[2]["tokens_generated"], 4);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_empty_prompt_is_unprocessable() {
    let orchestrator = started(&Config::default(), &MockModel::default());

    let response =
        send(&orchestrator, post_json("/inference/chat", &json!({"session_id": "s", "prompt": "  "}))).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body_json(response).await["detail"].is_string());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_returns_503() {
    let mut config = Config::default();
    config.queue.max_queue_size = 1;
    let model = MockModel::default()
        .with_tokens((0..100).map(|i| format!("t{i} ")))
        .with_token_delay(Duration::from_millis(50));
    let orchestrator = started(&config, &model);

    let running = orchestrator.handle(ChatRequest::new("a", "first")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator.queue_metrics().in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    let waiting = orchestrator.handle(ChatRequest::new("b", "second")).await.unwrap();

    let response =
        send(&orchestrator, post_json("/inference/chat", &json!({"session_id": "c", "prompt": "third"}))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "5");

    let metrics = body_json(send(&orchestrator, get("/metrics")).await).await;
    assert_eq!(metrics["rejected_requests"], 1);

    drop(running);
    drop(waiting);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_metrics_after_miss_and_hit() {
    let orchestrator = started(&Config::default(), &MockModel::default());
    let body = json!({"session_id": "s", "prompt": "count me"});
    send(&orchestrator, post_json("/inference/chat", &body)).await;
    send(&orchestrator, post_json("/inference/chat", &body)).await;

    let response = send(&orchestrator, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let metrics = body_json(response).await;
    assert_eq!(metrics["total_requests"], 2);
    assert_eq!(metrics["cache_hits_l1"], 1);
    assert_eq!(metrics["cache_hits_l2"], 0);
    assert_eq!(metrics["cache_misses"], 1);
    assert_eq!(metrics["cache_hit_rate"], 0.5);
    assert_eq!(metrics["queue_length"], 0);
    assert!(metrics["latencies_by_stage"].is_object());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_routes_served_under_api_prefix() {
    let orchestrator = started(&Config::default(), &MockModel::default());

    let health = send(&orchestrator, get("/api/v1/health")).await;
    assert_eq!(health.status(), StatusCode::OK);
    let health = body_json(health).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["model"], "mock");

    let response = send(
        &orchestrator,
        post_json("/api/v1/inference/chat", &json!({"session_id": "s", "prompt": "prefixed"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let root = body_json(send(&orchestrator, get("/")).await).await;
    assert_eq!(root["name"], "sluice");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_request_id_header() {
    let orchestrator = started(&Config::default(), &MockModel::default());

    let generated = send(&orchestrator, get("/health")).await;
    assert!(!generated.headers()[REQUEST_ID_HEADER].is_empty());

    let request = Request::builder().uri("/health").header(REQUEST_ID_HEADER, "abc-123").body(Body::empty()).unwrap();
    let echoed = send(&orchestrator, request).await;
    assert_eq!(echoed.headers()[REQUEST_ID_HEADER], "abc-123");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_unknown_request_is_404() {
    let orchestrator = started(&Config::default(), &MockModel::default());

    let uri = format!("/inference/cancel/{}", uuid::Uuid::new_v4());
    let response = send(&orchestrator, post_json(&uri, &json!({}))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_health_degraded_after_shutdown() {
    let orchestrator = started(&Config::default(), &MockModel::default());
    orchestrator.shutdown().await;

    let health = body_json(send(&orchestrator, get("/health")).await).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["processor_running"], false);

    let response = send(&orchestrator, post_json("/inference/chat", &json!({"session_id": "s", "prompt": "late"}))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
