// ABOUTME: Model listing route intersecting upstream deployments with the static catalog
// ABOUTME: Returns the id and display name of every catalog model actually available upstream
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Deployed-model listing
//!
//! `POST /api/models` queries the provider's model or deployment listing and
//! returns the entries that appear in the static catalog, as `[{id, name}]`.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;
use tracing::debug;

use crate::auth::ForwardedIdentity;
use crate::errors::AppError;
use crate::models::ModelListing;
use crate::resources::ServerResources;

/// Optional request body carrying a per-request key override
#[derive(Debug, Default, Deserialize)]
pub struct ModelsRequest {
    /// Key that overrides the configured upstream credential
    #[serde(default)]
    pub key: Option<String>,
}

/// Model listing routes handler
pub struct ModelRoutes;

impl ModelRoutes {
    /// Create the model listing routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/api/models", post(Self::list))
            .with_state(resources)
    }

    /// List the catalog models deployed upstream
    async fn list(
        State(resources): State<Arc<ServerResources>>,
        headers: HeaderMap,
        body: Option<Json<ModelsRequest>>,
    ) -> Result<Json<Vec<ModelListing>>, AppError> {
        let identity = ForwardedIdentity::from_headers(&headers);
        let request = body.map(|Json(r)| r).unwrap_or_default();
        let key = request.key.as_deref().filter(|k| !k.is_empty());

        let listings = resources.invoker.list_models(key, &identity).await?;
        debug!(count = listings.len(), "loaded models");
        Ok(Json(listings))
    }
}
