// ABOUTME: Provisioning route creating the assistant and vector store for file grounding
// ABOUTME: Returns the fresh ids the upload flow needs before any documents can be attached
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Grounding provisioning
//!
//! `POST /api/getids` creates a file-search assistant on the default model
//! and a vector store that expires thirty days after last activity, and
//! returns both ids. Clients call this once before uploading documents.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Serialize;
use tracing::info;

use crate::auth::ForwardedIdentity;
use crate::errors::AppError;
use crate::llm::ProvisionedIds;
use crate::resources::ServerResources;

/// Wire form of the provisioned id pair
#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    /// Assistant bound to the file-search tool
    #[serde(rename = "assistantId")]
    pub assistant_id: String,
    /// Vector store for uploaded documents
    #[serde(rename = "vectorStoreId")]
    pub vector_store_id: String,
}

impl From<ProvisionedIds> for ProvisionResponse {
    fn from(ids: ProvisionedIds) -> Self {
        Self {
            assistant_id: ids.assistant_id,
            vector_store_id: ids.vector_store_id,
        }
    }
}

/// Provisioning routes handler
pub struct ProvisionRoutes;

impl ProvisionRoutes {
    /// Create the provisioning routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/getids", post(Self::provision))
            .with_state(resources)
    }

    /// Provision a fresh assistant and vector store
    async fn provision(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
    ) -> Result<Json<ProvisionResponse>, AppError> {
        let identity = ForwardedIdentity::from_headers(&headers);
        let ids = resources
            .invoker
            .provision_grounding(None, &identity)
            .await?;
        info!(
            assistant_id = %ids.assistant_id,
            vector_store_id = %ids.vector_store_id,
            "provisioned grounding ids"
        );
        Ok(Json(ids.into()))
    }
}
