// ABOUTME: Centralized resource container wiring the upstream client, invoker, and relay
// ABOUTME: One production construction path plus a builder for test-time seam overrides
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Server Resources Module
//!
//! Centralized resource container for dependency injection. The token cache,
//! upstream client, invoker, and relay are built once at startup and shared
//! by every route handler. Tests swap the grounding resolver and audit sink
//! through [`ServerResourcesBuilder`] without touching the wiring.

use std::sync::Arc;

use crate::audit::{AuditLogger, AuditSink, TracingAuditSink};
use crate::auth::{CachedTokenProvider, ImdsTokenSource, TokenSource};
use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::grounding::{UnconfiguredResolver, VectorStoreTokenResolver};
use crate::llm::{AzureOpenAiClient, UpstreamInvoker};
use crate::relay::StreamRelay;

/// Shared state handed to every route handler
#[derive(Clone)]
pub struct ServerResources {
    /// Full server configuration
    pub config: Arc<ServerConfig>,
    /// Upstream dispatch across the three call shapes
    pub invoker: Arc<UpstreamInvoker>,
    /// Forwards upstream events to the client and writes the audit record
    pub relay: StreamRelay,
}

impl ServerResources {
    /// Wire the production resources from configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the upstream HTTP client cannot
    /// be built.
    pub fn new(config: ServerConfig) -> AppResult<Self> {
        Self::builder().with_config(config).build()
    }

    /// Create a new builder for `ServerResources`
    #[must_use]
    pub fn builder() -> ServerResourcesBuilder {
        ServerResourcesBuilder::new()
    }
}

/// Builder for `ServerResources`. Every seam has a production default, so
/// the server binary only supplies configuration while tests inject a static
/// resolver, a memory audit sink, or a canned token source.
pub struct ServerResourcesBuilder {
    config: Option<ServerConfig>,
    resolver: Option<Arc<dyn VectorStoreTokenResolver>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl ServerResourcesBuilder {
    /// Create a builder with production defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: None,
            resolver: None,
            audit_sink: None,
            token_source: None,
        }
    }

    /// Set the server configuration
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the vector-store token resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn VectorStoreTokenResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the audit sink
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Override the managed-identity token source
    #[must_use]
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Build the `ServerResources`
    ///
    /// # Errors
    ///
    /// Returns an error when no configuration was supplied or the upstream
    /// HTTP client cannot be built.
    pub fn build(self) -> AppResult<ServerResources> {
        let config = self
            .config
            .ok_or_else(|| AppError::config("server configuration is required"))?;

        let token_source = self
            .token_source
            .unwrap_or_else(|| Arc::new(ImdsTokenSource::from_env(reqwest::Client::new())));
        let tokens = Arc::new(CachedTokenProvider::new(token_source));

        let client = AzureOpenAiClient::new(config.upstream.clone(), tokens)?;

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(UnconfiguredResolver));
        let invoker = Arc::new(UpstreamInvoker::new(
            client,
            resolver,
            config.chat.clone(),
            config.relay.clone(),
        ));

        let audit_sink = self.audit_sink.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let relay = StreamRelay::new(config.relay.clone(), AuditLogger::new(audit_sink));

        Ok(ServerResources {
            config: Arc::new(config),
            invoker,
            relay,
        })
    }

    /// Build the `ServerResources` wrapped in an `Arc`
    ///
    /// # Errors
    ///
    /// Returns an error when no configuration was supplied or the upstream
    /// HTTP client cannot be built.
    pub fn build_arc(self) -> AppResult<Arc<ServerResources>> {
        Ok(Arc::new(self.build()?))
    }
}

impl Default for ServerResourcesBuilder {
    fn default() -> Self {
        Self::new()
    }
}
