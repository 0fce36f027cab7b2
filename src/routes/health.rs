// ABOUTME: Health check route handlers for service monitoring and status endpoints
// ABOUTME: Provides a cheap liveness probe and a deep probe that exercises the full relay pipeline
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Health check routes
//!
//! `GET /api/health` answers without touching the upstream. The deep probe
//! `GET /api/health-check` runs a synthetic one-message exchange against the
//! configured probe model through the normal invoke-and-relay pipeline, so
//! it exercises credentials, streaming, and audit logging end to end.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::info;

use crate::auth::ForwardedIdentity;
use crate::errors::AppError;
use crate::llm::{ChatMessage, ChatRequest, ConversationPayload, ModelRef};
use crate::resources::ServerResources;

/// Health routes handler
pub struct HealthRoutes;

impl HealthRoutes {
    /// Create the health check routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/health", get(Self::health))
            .route("/api/health-check", get(Self::deep_probe))
            .with_state(resources)
    }

    /// Liveness probe, no upstream traffic
    async fn health() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }

    /// Deep probe: a synthetic exchange through the full pipeline. Returns
    /// 200 only when the stream completes cleanly.
    async fn deep_probe(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
    ) -> Result<Json<serde_json::Value>, AppError> {
        let identity = ForwardedIdentity::from_headers(&headers);
        let user_name = identity.principal_name.clone();
        let chat = &resources.config.chat;
        let request = probe_request(&chat.probe_model_id, chat.temperature);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let invoked = resources
            .invoker
            .invoke(&request, &identity, cancel_rx)
            .await?;
        let relayed = resources.relay.stream_exchange(invoked, user_name);
        tokio::pin!(relayed);

        let mut bytes = 0usize;
        while let Some(chunk) = relayed.next().await {
            bytes += chunk?.len();
        }
        drop(cancel_tx);

        info!(model = %chat.probe_model_id, bytes, "deep health probe completed");
        Ok(Json(serde_json::json!({
            "status": "healthy",
            "model": chat.probe_model_id,
            "bytes": bytes,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })))
    }
}

/// The synthetic one-message exchange the deep probe runs
fn probe_request(model_id: &str, temperature: f32) -> ChatRequest {
    ChatRequest {
        prompt: None,
        conversation: ConversationPayload {
            id: None,
            model: ModelRef {
                id: model_id.to_owned(),
                name: None,
            },
            messages: vec![ChatMessage::user("test")],
            temperature: Some(temperature),
            vector_store_id: None,
            vector_store_jwe: None,
            assistant_id: None,
            file_ids: None,
        },
        key: None,
        use_grounding: false,
    }
}
