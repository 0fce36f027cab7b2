// ABOUTME: Plain streamed chat-completions call shape
// ABOUTME: Wire request type plus normalization of completion delta chunks
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::AzureOpenAiClient;
use super::{sse, EventStream, PreparedMessage, StreamEvent};
use crate::auth::ForwardedIdentity;
use crate::errors::AppResult;

/// Wire request for a streamed chat completion
#[derive(Debug, Serialize)]
pub(super) struct CompletionsRequest {
    pub model: String,
    pub messages: Vec<PreparedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
}

/// Streaming chunk as sent by the chat-completions API
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

/// Choice entry in a streaming chunk
#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

/// Incremental delta within a chunk choice
#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Normalize one chat-completion chunk. Chunks without a text delta (role
/// preludes, finish markers, content-filter results) are skipped.
pub(super) fn delta_event(value: &Value) -> Option<StreamEvent> {
    let chunk = ChatCompletionChunk::deserialize(value).ok()?;
    let delta = chunk.choices.into_iter().next()?.delta.content?;
    Some(StreamEvent::text(delta))
}

/// Open a streamed chat completion and normalize its events
pub(super) async fn stream(
    client: &AzureOpenAiClient,
    request: &CompletionsRequest,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<EventStream> {
    let response = client
        .post_stream("chat/completions", request, key, identity)
        .await?;
    Ok(sse::decode_sse_stream(response.bytes_stream()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_delta_event_extracts_text() {
        let value = json!({"choices": [{"delta": {"content": "Hello"}, "index": 0}]});
        assert_eq!(delta_event(&value), Some(StreamEvent::text("Hello")));
    }

    #[test]
    fn test_role_prelude_and_finish_chunks_are_skipped() {
        let prelude = json!({"choices": [{"delta": {"role": "assistant"}, "index": 0}]});
        assert_eq!(delta_event(&prelude), None);

        let finish = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        assert_eq!(delta_event(&finish), None);
    }

    #[test]
    fn test_empty_choices_are_skipped() {
        let value = json!({"choices": [], "prompt_filter_results": []});
        assert_eq!(delta_event(&value), None);
    }

    #[test]
    fn test_first_choice_wins() {
        let value = json!({"choices": [
            {"delta": {"content": "a"}},
            {"delta": {"content": "b"}}
        ]});
        assert_eq!(delta_event(&value), Some(StreamEvent::text("a")));
    }

    #[test]
    fn test_request_serialization_omits_absent_temperature() {
        let request = CompletionsRequest {
            model: "gpt-4o".to_owned(),
            messages: vec![PreparedMessage::new("user", "hi")],
            temperature: None,
            stream: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("temperature").is_none());
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][0]["role"], "user");
    }
}
