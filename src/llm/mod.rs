// ABOUTME: Upstream model invocation layer with normalized streaming events
// ABOUTME: Defines the chat wire types, call-shape selection, and the provider client surface
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Upstream Model Invocation
//!
//! One inbound chat request maps onto exactly one of three provider call
//! shapes: a plain streamed chat completion, a tool-augmented "responses"
//! call, or the legacy assistant/thread/run flow. Whatever the shape, the
//! provider's raw stream is normalized into [`StreamEvent`] before the relay
//! ever sees it, so citation rewriting and audit logging are shape-agnostic.
//!
//! ## Key Concepts
//!
//! - **`ChatRequest`**: the inbound exchange payload, newest-first history
//! - **`CallShape`**: which upstream call the invoker will issue, a pure
//!   function of the request's grounding fields
//! - **`StreamEvent`**: normalized text/error/end events from any shape
//! - **`UpstreamInvoker`**: binds the client, resolver, and catalog together

mod assistants;
mod client;
mod completions;
mod invoker;
mod responses;
mod sse;

pub use client::AzureOpenAiClient;
pub use invoker::{InvokedUpstream, ProvisionedIds, UpstreamInvoker};
pub use sse::{SseEvent, SseLineBuffer};

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::citations::Citation;
use crate::constants::defaults;
use crate::errors::AppError;

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction message
    System,
    /// User input message
    User,
    /// Assistant response message
    Assistant,
    /// File-attachment message injected by the upload flow
    #[serde(rename = "fileUpload")]
    FileUpload,
}

impl MessageRole {
    /// Convert to string representation for API calls
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::FileUpload => "fileUpload",
        }
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message. May itself be a JSON-encoded array of typed
    /// parts when the user attached files.
    pub content: String,
    /// Client-side creation timestamp, carried through to audit records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ChatMessage {
    /// Create a new chat message
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Typed content parts when the content is a JSON-encoded part array
    #[must_use]
    pub fn content_parts(&self) -> Option<Vec<ContentPart>> {
        serde_json::from_str(&self.content).ok()
    }
}

/// One typed part of a structured message content array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    /// Plain text
    Text {
        /// The text value
        text: String,
    },
    /// An attached file, referenced by provider id or carried inline
    File {
        /// Provider file id from a prior upload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        /// Original filename
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        /// Base64-encoded file bytes for inline upload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

/// A provider-ready message: wire role and text only, client timestamps
/// stripped. This is the exact shape sent upstream and recorded in audit
/// pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedMessage {
    /// Wire role (`system`, `user`, or `assistant`)
    pub role: String,
    /// Message text
    pub content: String,
}

impl PreparedMessage {
    /// Create a prepared message
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

// ============================================================================
// Inbound Request Types
// ============================================================================

/// Client model reference as sent by the picker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    /// Catalog id
    pub id: String,
    /// Display name, resolved against the catalog when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Conversation payload inside a chat request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    /// Opaque conversation id assigned by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Model to invoke
    pub model: ModelRef,
    /// Message history, newest first
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Raw vector store id for file-search grounding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_store_id: Option<String>,
    /// Opaque encrypted vector-store token
    #[serde(
        rename = "vectorStoreJWE",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub vector_store_jwe: Option<String>,
    /// Assistant id for the legacy flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    /// Uploaded file ids for the legacy flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ids: Option<Vec<String>>,
}

/// Inbound body of one chat exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// System prompt override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// The conversation to continue
    pub conversation: ConversationPayload,
    /// Per-request upstream API key override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Whether to ground the response with web search
    #[serde(default)]
    pub use_grounding: bool,
}

fn present(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

impl ChatRequest {
    /// Effective system prompt: the request's own when non-empty, otherwise
    /// the supplied deployment default
    #[must_use]
    pub fn system_prompt_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.prompt
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(default)
    }

    /// Whether the request references a vector store, by id or token
    #[must_use]
    pub fn has_vector_store_ref(&self) -> bool {
        present(self.conversation.vector_store_id.as_ref())
            || present(self.conversation.vector_store_jwe.as_ref())
    }

    /// Whether the request carries legacy assistant or file-id references
    #[must_use]
    pub fn has_legacy_refs(&self) -> bool {
        present(self.conversation.assistant_id.as_ref())
            || self
                .conversation
                .file_ids
                .as_ref()
                .is_some_and(|ids| !ids.is_empty())
    }

    /// Which upstream call shape this request selects
    #[must_use]
    pub fn call_shape(&self) -> CallShape {
        select_call_shape(
            self.use_grounding,
            self.has_vector_store_ref(),
            self.has_legacy_refs(),
        )
    }
}

// ============================================================================
// Call Shape Selection
// ============================================================================

/// The upstream call a request maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// Plain streamed chat completion
    Completion,
    /// Tool-augmented streamed responses call
    Responses,
    /// Legacy assistant/thread/run flow
    AssistantRun,
}

/// Select the call shape from the request's grounding fields. A vector store
/// reference takes precedence over raw legacy file ids when both are present.
#[must_use]
pub const fn select_call_shape(
    use_grounding: bool,
    has_vector_store_ref: bool,
    has_legacy_refs: bool,
) -> CallShape {
    if use_grounding || has_vector_store_ref {
        CallShape::Responses
    } else if has_legacy_refs {
        CallShape::AssistantRun
    } else {
        CallShape::Completion
    }
}

// ============================================================================
// Normalized Stream Events
// ============================================================================

/// A normalized upstream stream event. All three raw provider shapes are
/// mapped into this union before citation rewriting or relaying.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text delta, with any citation annotations attached to it
    Text {
        /// The generated text
        delta: String,
        /// Citation annotations scoped to this delta
        citations: Vec<Citation>,
    },
    /// Terminal failure reported inside the stream
    Error {
        /// Failure or incomplete reason
        message: String,
    },
    /// Upstream signaled normal completion
    End,
}

impl StreamEvent {
    /// A plain text delta without annotations
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text {
            delta: delta.into(),
            citations: Vec::new(),
        }
    }
}

/// Stream type for normalized upstream events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AppError>> + Send>>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_selection_is_pure_over_grounding_fields() {
        for use_grounding in [false, true] {
            for vector_ref in [false, true] {
                let shape = select_call_shape(use_grounding, vector_ref, false);
                if use_grounding || vector_ref {
                    assert_eq!(shape, CallShape::Responses);
                } else {
                    assert_eq!(shape, CallShape::Completion);
                }
            }
        }
    }

    #[test]
    fn test_legacy_refs_select_assistant_run() {
        assert_eq!(
            select_call_shape(false, false, true),
            CallShape::AssistantRun
        );
    }

    #[test]
    fn test_vector_store_ref_takes_precedence_over_legacy() {
        assert_eq!(select_call_shape(false, true, true), CallShape::Responses);
    }

    #[test]
    fn test_request_parsing_and_shape() {
        let body = serde_json::json!({
            "prompt": "",
            "conversation": {
                "id": "c-1",
                "model": {"id": "gpt-4"},
                "messages": [{"role": "user", "content": "hello"}],
                "temperature": 0.5,
                "vectorStoreJWE": "token-a"
            },
            "useGrounding": false
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();

        assert_eq!(
            request.system_prompt_or(defaults::SYSTEM_PROMPT),
            defaults::SYSTEM_PROMPT
        );
        assert!(request.has_vector_store_ref());
        assert!(!request.has_legacy_refs());
        assert_eq!(request.call_shape(), CallShape::Responses);
        assert_eq!(request.conversation.model.id, "gpt-4");
    }

    #[test]
    fn test_empty_refs_are_ignored() {
        let body = serde_json::json!({
            "conversation": {
                "model": {"id": "gpt5", "name": "GPT-5"},
                "messages": [],
                "vectorStoreId": "",
                "assistantId": "",
                "fileIds": []
            }
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();

        assert!(!request.has_vector_store_ref());
        assert!(!request.has_legacy_refs());
        assert_eq!(request.call_shape(), CallShape::Completion);
    }

    #[test]
    fn test_file_upload_role_round_trips() {
        let message: ChatMessage =
            serde_json::from_str(r#"{"role":"fileUpload","content":"[]"}"#).unwrap();
        assert_eq!(message.role, MessageRole::FileUpload);
        assert_eq!(
            serde_json::to_value(&message).unwrap()["role"],
            "fileUpload"
        );
    }

    #[test]
    fn test_content_parts_parse_only_valid_arrays() {
        let structured = ChatMessage::user(
            r#"[{"type":"text","text":"see attachment"},{"type":"file","file_id":"file-1","filename":"a.pdf"}]"#,
        );
        let parts = structured.content_parts().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1],
            ContentPart::File {
                file_id: Some("file-1".into()),
                filename: Some("a.pdf".into()),
                data: None,
            }
        );

        assert!(ChatMessage::user("plain text").content_parts().is_none());
    }
}
