// ABOUTME: Streaming chat route handler relaying upstream model output to the client
// ABOUTME: Accepts the conversation payload and answers with an incrementally flushed text stream
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! The core chat endpoint
//!
//! `POST /api/chat` takes a conversation payload, invokes the upstream
//! provider through the selected call shape, and relays the rewritten text
//! deltas back as an incrementally flushed chunked body. The response
//! carries stream-friendly headers but is raw text, not framed SSE.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::post,
    Json, Router,
};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::info;

use crate::auth::ForwardedIdentity;
use crate::errors::AppError;
use crate::llm::ChatRequest;
use crate::resources::ServerResources;

/// Chat routes handler
pub struct ChatRoutes;

impl ChatRoutes {
    /// Create the chat routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/chat", post(Self::chat))
            .with_state(resources)
    }

    /// Run one chat exchange and stream the relayed output
    async fn chat(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        Json(request): Json<ChatRequest>,
    ) -> Result<Response, AppError> {
        let identity = ForwardedIdentity::from_headers(&headers);
        let user_name = identity.principal_name.clone();
        info!(
            model = %request.conversation.model.id,
            shape = ?request.call_shape(),
            grounding = request.use_grounding,
            "chat exchange requested"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let invoked = resources
            .invoker
            .invoke(&request, &identity, cancel_rx)
            .await?;
        let relayed = resources.relay.stream_exchange(invoked, user_name);

        let body = async_stream::stream! {
            // The sender lives as long as the response body. Dropping it,
            // on client abort or normal completion, ends any in-flight
            // assistant-run poll loop.
            let _cancel = cancel_tx;
            tokio::pin!(relayed);
            while let Some(chunk) = relayed.next().await {
                yield chunk;
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache, no-transform")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(body))
            .map_err(|e| AppError::internal(format!("failed to build stream response: {e}")))
    }
}
