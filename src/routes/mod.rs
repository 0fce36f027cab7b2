// ABOUTME: Route module organization for the relay's HTTP endpoints
// ABOUTME: Centralized router assembly with tracing, request-id, and CORS layers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Route modules for the relay server
//!
//! Each domain module contains route definitions and thin handlers that
//! delegate to the shared [`ServerResources`]. [`router`] merges them and
//! wraps the result in the tracing, request-id, and CORS layers.

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::resources::ServerResources;

/// Streaming chat endpoint
pub mod chat;
/// Liveness and deep health probes
pub mod health;
/// Deployed-model listing endpoint
pub mod models;
/// Assistant and vector-store provisioning endpoint
pub mod provision;

pub use chat::ChatRoutes;
pub use health::HealthRoutes;
pub use models::ModelRoutes;
pub use provision::ProvisionRoutes;

/// Assemble the full application router
#[must_use]
pub fn router(resources: Arc<ServerResources>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(ChatRoutes::routes(resources.clone()))
        .merge(ModelRoutes::routes(resources.clone()))
        .merge(ProvisionRoutes::routes(resources.clone()))
        .merge(HealthRoutes::routes(resources))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors),
        )
}
