// ABOUTME: Shared test utilities for integration tests
// ABOUTME: Provides quiet logging, a loopback stub upstream, and wired test resources
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Shared test utilities for `chatstream`
//!
//! Every integration suite talks to a stub upstream bound to an ephemeral
//! loopback port and asserts on audit output through a memory sink.

use std::sync::{Arc, Once};
use std::time::Duration;

use axum::Router;
use chatstream::audit::MemoryAuditSink;
use chatstream::config::{ApiType, ChatDefaults, RelayTuning, ServerConfig, UpstreamConfig};
use chatstream::resources::ServerResources;

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// Serve `router` as a stub upstream on an ephemeral loopback port and
/// return its base URL
pub async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// SSE body from raw JSON payloads, terminated with `[DONE]`
pub fn sse_body<S: AsRef<str>>(events: &[S]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str("data: ");
        body.push_str(event.as_ref());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Response headers for a stub SSE endpoint
pub fn sse_headers() -> [(axum::http::HeaderName, &'static str); 1] {
    [(axum::http::header::CONTENT_TYPE, "text/event-stream")]
}

/// Server configuration pointed at a stub upstream, with relay tuning fast
/// enough for tests
pub fn test_config(upstream_url: &str) -> ServerConfig {
    ServerConfig {
        http_port: 0,
        upstream: UpstreamConfig {
            host: upstream_url.to_owned(),
            api_type: ApiType::OpenAi,
            api_version: "2024-12-01-preview".into(),
            api_key: Some("sk-test".into()),
            organization: None,
            use_managed_identity: false,
            apim_enabled: false,
            apim_key: None,
        },
        chat: ChatDefaults {
            system_prompt: "You are a relay test.".into(),
            temperature: 0.5,
            model_id: "gpt-4o".into(),
            probe_model_id: "gpt-35-turbo".into(),
        },
        relay: RelayTuning {
            citation_hold_chunks: 50,
            citation_hold_timeout: Duration::from_millis(500),
            run_poll_interval: Duration::from_millis(10),
            run_poll_max_attempts: Some(50),
        },
    }
}

/// Build server resources against `config` with a memory audit sink
pub fn build_resources(config: ServerConfig) -> (Arc<ServerResources>, Arc<MemoryAuditSink>) {
    init_test_logging();
    let sink = Arc::new(MemoryAuditSink::new());
    let resources = ServerResources::builder()
        .with_config(config)
        .with_audit_sink(sink.clone())
        .build_arc()
        .unwrap();
    (resources, sink)
}

/// Resources wired to a stub upstream in one call
pub async fn resources_for(upstream: Router) -> (Arc<ServerResources>, Arc<MemoryAuditSink>) {
    let base = spawn_upstream(upstream).await;
    build_resources(test_config(&base))
}
