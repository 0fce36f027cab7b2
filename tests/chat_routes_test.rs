// ABOUTME: Integration tests for the streaming chat route
// ABOUTME: Drives the relay end to end against a stub upstream and asserts on bytes and audit output
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use common::{resources_for, sse_body, sse_headers};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tower::ServiceExt;

use chatstream::routes::ChatRoutes;

// ============================================================================
// Test Helpers
// ============================================================================

fn chat_request_body(model_id: &str, use_grounding: bool) -> Value {
    json!({
        "prompt": "You are a test assistant",
        "conversation": {
            "model": {"id": model_id},
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.5
        },
        "useGrounding": use_grounding
    })
}

async fn post_chat(router: Router, body: &Value) -> axum::response::Response {
    post_chat_with_headers(router, body, &[]).await
}

async fn post_chat_with_headers(
    router: Router,
    body: &Value,
    extra: &[(&str, &str)],
) -> axum::response::Response {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    router.oneshot(request).await.unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

type Captured = Arc<Mutex<Option<Value>>>;

/// Stub completions endpoint that records the request body and streams the
/// given deltas
fn completions_stub(captured: Captured, deltas: &[&str]) -> Router {
    let payloads: Vec<String> = deltas
        .iter()
        .map(|d| format!(r#"{{"choices":[{{"delta":{{"content":"{d}"}}}}]}}"#))
        .collect();
    let body = sse_body(&payloads);
    Router::new().route(
        "/v1/chat/completions",
        post(move |Json(request): Json<Value>| {
            let captured = captured.clone();
            let body = body.clone();
            async move {
                *captured.lock().unwrap() = Some(request);
                (sse_headers(), body)
            }
        }),
    )
}

// ============================================================================
// Streaming Exchange Tests
// ============================================================================

#[tokio::test]
async fn test_chat_streams_completion_deltas() {
    let captured: Captured = Arc::new(Mutex::new(None));
    let upstream = completions_stub(captured.clone(), &["Hi", " there"]);
    let (resources, sink) = resources_for(upstream).await;

    let response = post_chat(
        ChatRoutes::routes(resources),
        &chat_request_body("gpt-4", false),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache, no-transform"
    );
    assert_eq!(body_text(response).await, "Hi there");

    // The upstream saw the aliased deployment and the prepared messages
    let seen = captured.lock().unwrap().take().unwrap();
    assert_eq!(seen["model"], "gpt-4o");
    assert_eq!(seen["stream"], true);
    assert!((seen["temperature"].as_f64().unwrap() - 0.5).abs() < f64::EPSILON);
    assert_eq!(seen["messages"][0]["role"], "system");
    assert_eq!(seen["messages"][0]["content"], "You are a test assistant");
    assert_eq!(seen["messages"][1]["role"], "user");
    assert_eq!(seen["messages"][1]["content"], "hello");

    // Exactly one audit record for the exchange
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].model, "GPT-4");
    assert_eq!(records[0].temperature, Some(0.5));
    assert_eq!(records[0].page, 1);
    assert_eq!(records[0].total_pages, 1);
    assert!(records[0].user_name.is_none());
    assert!(!records[0].log_id.is_empty());
    assert!(records[0].messages_json.contains("Hi there"));
}

#[tokio::test]
async fn test_chat_upstream_error_before_stream_is_500() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": {
                        "message": "Rate limit exceeded",
                        "type": "tokens",
                        "param": null,
                        "code": "rate_limit_exceeded"
                    }
                })),
            )
                .into_response()
        }),
    );
    let (resources, sink) = resources_for(upstream).await;

    let response = post_chat(
        ChatRoutes::routes(resources),
        &chat_request_body("gpt-4", false),
    )
    .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = body_text(response).await;
    assert!(text.contains("Rate limit exceeded"), "body: {text}");

    // Nothing streamed, so nothing was audited
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_chat_failed_generation_finalizes_audit() {
    let captured: Captured = Arc::new(Mutex::new(None));
    let seen = captured.clone();
    let body = sse_body(&[
        r#"{"type":"response.content_part.done","part":{"type":"output_text","text":"partial","annotations":[]}}"#,
        r#"{"type":"response.failed","response":{"error":{"message":"rate_limited"}}}"#,
    ]);
    let upstream = Router::new().route(
        "/v1/responses",
        post(move |Json(request): Json<Value>| {
            let seen = seen.clone();
            let body = body.clone();
            async move {
                *seen.lock().unwrap() = Some(request);
                (sse_headers(), body)
            }
        }),
    );
    let (resources, sink) = resources_for(upstream).await;

    let response = post_chat(
        ChatRoutes::routes(resources),
        &chat_request_body("gpt-4o", true),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // The streamed text arrives, then the body errors out
    let mut stream = response.into_body().into_data_stream();
    let mut collected = Vec::new();
    let mut errored = false;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => collected.extend_from_slice(&bytes),
            Err(_) => {
                errored = true;
                break;
            }
        }
    }
    assert_eq!(String::from_utf8(collected).unwrap(), "partial");
    assert!(errored, "expected the body stream to signal the failure");

    // Grounding selected the responses call with the web search tool
    let seen = captured.lock().unwrap().take().unwrap();
    assert_eq!(seen["tools"][0]["type"], "web_search");

    // The audit record carries the trailing error annotation
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .messages_json
        .contains("partial\\n\\nError: rate_limited"));
}

#[tokio::test]
async fn test_chat_forwards_principal_to_upstream_and_audit() {
    let headers_seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let seen = headers_seen.clone();
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(move |headers: axum::http::HeaderMap| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = headers
                    .get("x-ms-client-principal-name")
                    .and_then(|v| v.to_str().ok())
                    .map(ToOwned::to_owned);
                (
                    sse_headers(),
                    sse_body(&[r#"{"choices":[{"delta":{"content":"ok"}}]}"#]),
                )
            }
        }),
    );
    let (resources, sink) = resources_for(upstream).await;

    let response = post_chat_with_headers(
        ChatRoutes::routes(resources),
        &chat_request_body("gpt-4", false),
        &[("x-ms-client-principal-name", "sam@example.gov")],
    )
    .await;
    assert_eq!(body_text(response).await, "ok");

    assert_eq!(
        headers_seen.lock().unwrap().as_deref(),
        Some("sam@example.gov")
    );
    let records = sink.records();
    assert_eq!(records[0].user_name.as_deref(), Some("sam@example.gov"));
}
