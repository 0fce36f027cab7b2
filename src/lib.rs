// ABOUTME: Main library entry point for the chatstream streaming chat relay
// ABOUTME: Binds upstream model invocation, citation rewriting, stream relaying, and audit logging
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

// Crate-level attributes:
// - recursion_limit: Increased from default 128 to 256 for complex derive macros
//   (serde, thiserror) on deeply nested wire types
// - deny(unsafe_code): Zero-tolerance unsafe policy
#![recursion_limit = "256"]
#![deny(unsafe_code)]

//! # Chatstream
//!
//! Server-side streaming chat relay for Azure `OpenAI`. Sits between a
//! browser chat client and the provider's Chat Completions, Responses, and
//! Assistants APIs.
//!
//! ## Features
//!
//! - **Three call shapes**: plain streamed chat completion, tool-grounded
//!   responses call (web search / file search), and the legacy
//!   assistant/thread/run flow
//! - **Incremental relay**: upstream tokens are forwarded to the browser as
//!   they arrive, over an incrementally flushed chunked response
//! - **Citation rewriting**: provider citation sentinels and annotations are
//!   rewritten into a stable bracketed form against a file-id/filename table
//! - **Audit logging**: every exchange is serialized into size-bounded JSON
//!   log pages with a fresh correlation id
//!
//! ## Quick Start
//!
//! 1. Export the upstream credentials (`OPENAI_API_HOST`, `OPENAI_API_TYPE`,
//!    `OPENAI_API_KEY`, ...)
//! 2. Start the relay with `chatstream-server`
//! 3. Point the web client at `POST /api/chat`
//!
//! ## Architecture
//!
//! The crate follows a modular architecture:
//! - **Llm**: upstream wire types, SSE decoding, and call-shape selection
//! - **Citations**: pure two-pass rewriting of citation markers
//! - **Relay**: normalized event stream to response bytes, with partial
//!   sentinel buffering
//! - **Audit**: paginated exchange records on stream completion
//! - **Routes**: the axum endpoints binding the pipeline together
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chatstream::config::ServerConfig;
//! use chatstream::errors::AppResult;
//!
//! fn main() -> AppResult<()> {
//!     // Load configuration
//!     let config = ServerConfig::from_env()?;
//!
//!     println!("chatstream configured for upstream: {}", config.upstream.host);
//!
//!     Ok(())
//! }
//! ```

// ── Public API ──────────────────────────────────────────────────────────
// These modules are used by the server binary (src/bin/) and integration
// tests (tests/). They must remain `pub` so external consumers can access them.

/// Audit logging of completed exchanges in size-bounded JSON pages
pub mod audit;

/// Upstream credential schemes and outbound header assembly
pub mod auth;

/// Citation annotation types and the two-pass citation rewriter
pub mod citations;

/// Configuration management from environment variables
pub mod config;

/// Application constants and deployment defaults
pub mod constants;

/// Unified error handling system with standard error codes and HTTP responses
pub mod errors;

/// Vector-store token resolution seam and grounding references
pub mod grounding;

/// Upstream model invocation across the three provider call shapes
pub mod llm;

/// Production logging and structured output
pub mod logging;

/// Static model catalog and display-name resolution
pub mod models;

/// Stream relay from normalized upstream events to response bytes
pub mod relay;

/// Shared server resources handed to route handlers
pub mod resources;

/// HTTP route handlers and router assembly
pub mod routes;
