// ABOUTME: System-wide constants and deployment defaults for the chatstream relay
// ABOUTME: Groups upstream defaults, relay limits, and the identity/credential header names
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Constants Module
//!
//! Hardcoded constants shared across modules. Anything an operator may need to
//! change at deploy time lives in [`crate::config`] instead; the values here
//! are either protocol facts (header names) or defaults the configuration
//! layer falls back to.

/// Deployment defaults mirrored by the configuration layer
pub mod defaults {
    /// System prompt injected when the client does not send one
    pub const SYSTEM_PROMPT: &str = "You are an AI Assistant that uses Azure OpenAI. Follow the user's instructions carefully. Respond using markdown.";

    /// Sampling temperature applied when the client does not send one
    pub const TEMPERATURE: f32 = 0.5;

    /// Model used for assistant provisioning when none is specified
    pub const MODEL_ID: &str = "gpt5";

    /// Model the deep health probe runs its synthetic exchange against
    pub const PROBE_MODEL_ID: &str = "gpt-35-turbo";

    /// Upstream API host when `OPENAI_API_HOST` is unset
    pub const API_HOST: &str = "https://api.openai.com";

    /// Azure API version when `OPENAI_API_VERSION` is unset
    pub const API_VERSION: &str = "2024-12-01-preview";

    /// HTTP listen port when `HTTP_PORT` is unset
    pub const HTTP_PORT: u16 = 3000;

    /// Server version from Cargo.toml
    pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Fixed limits of the relay and audit pipeline
pub mod limits {
    /// Characters per audit log page. Chosen so each page, re-encoded as a
    /// JSON string value, stays under typical log-ingestion per-event limits.
    pub const AUDIT_PAGE_CHARS: usize = 5000;

    /// Upper bound on sentinel rewrite iterations over one text block,
    /// guarding against malformed repeating sentinels
    pub const CITATION_REWRITE_MAX_PASSES: usize = 10;

    /// Default chunk countdown while holding text that contains an unfinished
    /// citation sentinel
    pub const CITATION_HOLD_CHUNKS: u32 = 50;

    /// Default hard timeout for the citation hold window, in seconds
    pub const CITATION_HOLD_TIMEOUT_SECS: u64 = 5;

    /// Default interval between assistant-run status polls, in seconds
    pub const RUN_POLL_INTERVAL_SECS: u64 = 2;

    /// Provisioned vector stores expire this many days after last activity
    pub const VECTOR_STORE_EXPIRY_DAYS: u32 = 30;
}

/// Header names used on inbound and outbound requests
pub mod headers {
    /// Forwarded principal name set by the hosting gateway
    pub const CLIENT_PRINCIPAL_NAME: &str = "x-ms-client-principal-name";

    /// Forwarded encoded principal claims set by the hosting gateway
    pub const CLIENT_PRINCIPAL: &str = "x-ms-client-principal";

    /// Forwarded principal object id set by the hosting gateway
    pub const CLIENT_PRINCIPAL_ID: &str = "x-ms-client-principal-id";

    /// Azure `OpenAI` static credential header
    pub const AZURE_API_KEY: &str = "api-key";

    /// API-management gateway subscription key header
    pub const APIM_SUBSCRIPTION_KEY: &str = "Ocp-Apim-Subscription-Key";

    /// `OpenAI` organization scoping header
    pub const OPENAI_ORGANIZATION: &str = "OpenAI-Organization";
}
