// ABOUTME: Tool-augmented responses call shape for grounded chat
// ABOUTME: Wire request with web/file search tools and responses event normalization
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::AzureOpenAiClient;
use super::{sse, EventStream, PreparedMessage, StreamEvent};
use crate::auth::ForwardedIdentity;
use crate::citations::Citation;
use crate::errors::AppResult;

/// Wire request for a streamed responses call
#[derive(Debug, Serialize)]
pub(super) struct ResponsesRequest {
    pub model: String,
    pub input: Vec<PreparedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

/// Tool attached to a responses call
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum ToolSpec {
    /// Web grounding
    WebSearch,
    /// File search over the given vector stores
    FileSearch { vector_store_ids: Vec<String> },
}

/// Responses stream event envelope. Only the `type` discriminant plus the
/// fields the relay cares about are modeled.
#[derive(Debug, Deserialize)]
struct ResponsesEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    part: Option<DonePart>,
    #[serde(default)]
    response: Option<ResponseState>,
}

/// Completed content part inside `response.content_part.done`
#[derive(Debug, Deserialize)]
struct DonePart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    annotations: Vec<Value>,
}

/// Response snapshot attached to terminal events
#[derive(Debug, Deserialize)]
struct ResponseState {
    #[serde(default)]
    error: Option<ResponseError>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

/// Normalize one responses stream event.
///
/// Completed `output_text` parts become text events carrying their citation
/// annotations. Failed and incomplete responses become terminal errors with
/// the provider's reason when one is given. Everything else, per-token
/// delta events included, is skipped because the full text of each part
/// arrives again in its done event.
pub(super) fn stream_event(value: &Value) -> Option<StreamEvent> {
    let event = ResponsesEvent::deserialize(value).ok()?;
    match event.kind.as_str() {
        "response.content_part.done" => {
            let part = event.part?;
            if part.kind != "output_text" {
                return None;
            }
            let delta = part.text?;
            let citations = part
                .annotations
                .into_iter()
                .map(|a| serde_json::from_value(a).unwrap_or(Citation::Other))
                .collect();
            Some(StreamEvent::Text { delta, citations })
        }
        "response.failed" | "response.incomplete" => {
            let message = event
                .response
                .and_then(failure_reason)
                .unwrap_or(event.kind);
            Some(StreamEvent::Error { message })
        }
        _ => None,
    }
}

/// Provider-supplied failure reason, if any was given
fn failure_reason(state: ResponseState) -> Option<String> {
    state
        .error
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty())
        .or_else(|| {
            state
                .incomplete_details
                .and_then(|d| d.reason)
                .filter(|r| !r.is_empty())
        })
}

/// Open a streamed responses call and normalize its events
pub(super) async fn stream(
    client: &AzureOpenAiClient,
    request: &ResponsesRequest,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<EventStream> {
    let response = client.post_stream("responses", request, key, identity).await?;
    Ok(sse::decode_sse_stream(response.bytes_stream()))
}
