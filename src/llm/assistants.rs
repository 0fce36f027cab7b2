// ABOUTME: Legacy assistant/thread/run call shape and vector store provisioning
// ABOUTME: Run polling with cancellation, thread construction, file name lookups
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Legacy grounded-chat flow.
//!
//! Conversations that carry an `assistantId` or raw uploaded `fileIds` run
//! through the assistants API: ensure an assistant exists, create a thread
//! holding the chronological history with attachments on the final user
//! message, start a streamed run, and confirm the terminal run status by
//! polling. The poll loop honors a cancellation signal so an abandoned
//! exchange stops hitting the provider.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::client::AzureOpenAiClient;
use super::sse::SseEvent;
use super::{EventStream, PreparedMessage, SseLineBuffer, StreamEvent};
use crate::auth::ForwardedIdentity;
use crate::citations::{Citation, FileIdNameMap};
use crate::config::RelayTuning;
use crate::constants::limits;
use crate::errors::{AppError, AppResult};

// ============================================================================
// Wire Types
// ============================================================================

/// Everything the run flow needs from an inbound request
#[derive(Debug, Clone)]
pub(super) struct AssistantRunSpec {
    /// Existing assistant to reuse, or `None` to create one
    pub assistant_id: Option<String>,
    /// Model for a freshly created assistant
    pub model: String,
    /// Run instructions (the effective system prompt)
    pub instructions: String,
    /// Chronological history, roles already flattened to `user`/`assistant`
    pub messages: Vec<PreparedMessage>,
    /// File ids attached to the final user message
    pub attachment_file_ids: Vec<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    assistant_id: &'a str,
    instructions: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

/// Run object snapshot, from stream events and status polls alike
#[derive(Debug, Deserialize)]
struct RunState {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    message: Option<String>,
}

impl RunState {
    fn is_terminal(&self) -> bool {
        !matches!(self.status.as_str(), "queued" | "in_progress" | "cancelling")
    }

    fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    fn failure_message(&self) -> String {
        self.last_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("run ended with status {}", self.status))
    }
}

/// Message delta event envelope
#[derive(Debug, Deserialize)]
struct ThreadDeltaEvent {
    object: String,
    #[serde(default)]
    delta: MessageDelta,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: Vec<MessagePart>,
}

/// One entry of a message content array, shared by deltas and full messages
#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<PartText>,
}

#[derive(Debug, Deserialize)]
struct PartText {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    annotations: Vec<Value>,
}

// ============================================================================
// Event Normalization
// ============================================================================

/// Normalize one assistant run event. Only message deltas produce output;
/// run lifecycle and step events are tracked separately by the run loop.
pub(super) fn stream_event(value: &Value) -> Option<StreamEvent> {
    let event = ThreadDeltaEvent::deserialize(value).ok()?;
    if event.object != "thread.message.delta" {
        return None;
    }
    collect_text(event.delta.content)
        .map(|(delta, citations)| StreamEvent::Text { delta, citations })
}

/// Concatenate the text parts of a content array and gather their
/// annotations. Returns `None` when no text part is present at all.
fn collect_text(parts: Vec<MessagePart>) -> Option<(String, Vec<Citation>)> {
    let mut text = String::new();
    let mut citations = Vec::new();
    let mut saw_text = false;

    for part in parts {
        if part.kind != "text" {
            continue;
        }
        let Some(part_text) = part.text else {
            continue;
        };
        saw_text = true;
        if let Some(value) = part_text.value {
            text.push_str(&value);
        }
        citations.extend(
            part_text
                .annotations
                .into_iter()
                .map(|a| serde_json::from_value(a).unwrap_or(Citation::Other)),
        );
    }

    saw_text.then_some((text, citations))
}

fn run_snapshot(value: &Value) -> Option<RunState> {
    if value.get("object").and_then(Value::as_str) != Some("thread.run") {
        return None;
    }
    RunState::deserialize(value).ok()
}

/// Newest assistant message in a thread listing, as a normalized text event
fn assistant_message_event(listing: &Value) -> Option<StreamEvent> {
    let entries = listing.get("data").and_then(Value::as_array)?;
    let message = entries
        .iter()
        .find(|entry| entry.get("role").and_then(Value::as_str) == Some("assistant"))?;
    let parts: Vec<MessagePart> =
        serde_json::from_value(message.get("content").cloned().unwrap_or_default()).ok()?;
    collect_text(parts).map(|(delta, citations)| StreamEvent::Text { delta, citations })
}

// ============================================================================
// Provisioning Operations
// ============================================================================

fn extract_id(value: &Value, what: &str) -> AppResult<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::upstream(format!("{what} creation response is missing an id")))
}

/// Create a file-search assistant and return its id
pub(super) async fn create_assistant(
    client: &AzureOpenAiClient,
    model: &str,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<String> {
    let body = json!({"model": model, "tools": [{"type": "file_search"}]});
    let value = client.post_json("assistants", &body, key, identity).await?;
    extract_id(&value, "assistant")
}

/// Create an expiring vector store and return its id
pub(super) async fn create_vector_store(
    client: &AzureOpenAiClient,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<String> {
    let body = json!({
        "expires_after": {
            "anchor": "last_active_at",
            "days": limits::VECTOR_STORE_EXPIRY_DAYS,
        }
    });
    let value = client.post_json("vector_stores", &body, key, identity).await?;
    extract_id(&value, "vector store")
}

/// Build the id-to-filename table for a vector store, preserving the
/// provider's listing order because citation sentinels reference files by
/// position
pub(super) async fn file_id_name_map(
    client: &AzureOpenAiClient,
    vector_store_id: &str,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<FileIdNameMap> {
    let listing = client
        .get_json(
            &format!("vector_stores/{vector_store_id}/files"),
            key,
            identity,
        )
        .await?;

    let mut map = FileIdNameMap::new();
    let entries = listing
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in &entries {
        let Some(file_id) = entry.get("id").and_then(Value::as_str) else {
            continue;
        };
        let file = client
            .get_json(&format!("files/{file_id}"), key, identity)
            .await?;
        let name = file
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or(file_id);
        map.insert(file_id, name);
    }
    debug!(files = map.len(), "built vector store file name table");
    Ok(map)
}

/// Upload one file for assistant use
pub(super) async fn upload_file(
    client: &AzureOpenAiClient,
    filename: &str,
    bytes: Vec<u8>,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<String> {
    client.upload_file(filename, bytes, key, identity).await
}

// ============================================================================
// Run Flow
// ============================================================================

/// Thread creation payload: chronological messages, with attachments on
/// the final user message so file search covers the uploads
fn thread_messages(spec: &AssistantRunSpec) -> Vec<Value> {
    let last_user = spec.messages.iter().rposition(|m| m.role == "user");
    spec.messages
        .iter()
        .enumerate()
        .map(|(i, message)| {
            let mut entry = json!({"role": message.role, "content": message.content});
            if Some(i) == last_user && !spec.attachment_file_ids.is_empty() {
                let attachments: Vec<Value> = spec
                    .attachment_file_ids
                    .iter()
                    .map(|id| json!({"file_id": id, "tools": [{"type": "file_search"}]}))
                    .collect();
                entry["attachments"] = Value::Array(attachments);
            }
            entry
        })
        .collect()
}

async fn create_thread(
    client: &AzureOpenAiClient,
    spec: &AssistantRunSpec,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<String> {
    let body = json!({ "messages": thread_messages(spec) });
    let value = client.post_json("threads", &body, key, identity).await?;
    extract_id(&value, "thread")
}

/// Poll a run until it reaches a terminal status.
///
/// The interval and optional attempt cap come from the relay tuning. The
/// caller supplies a cancellation signal; when it fires (or its sender is
/// dropped) the loop stops with an incomplete-generation error instead of
/// polling an abandoned exchange forever.
async fn wait_for_run(
    client: &AzureOpenAiClient,
    thread_id: &str,
    run_id: &str,
    tuning: &RelayTuning,
    cancel: &mut watch::Receiver<bool>,
    key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<RunState> {
    let path = format!("threads/{thread_id}/runs/{run_id}");
    let mut attempts: u32 = 0;

    loop {
        let value = client.get_json(&path, key, identity).await?;
        let run = RunState::deserialize(&value)
            .map_err(|e| AppError::upstream(format!("unreadable run status: {e}")))?;
        if run.is_terminal() {
            return Ok(run);
        }

        attempts += 1;
        if tuning
            .run_poll_max_attempts
            .is_some_and(|max| attempts >= max)
        {
            warn!(run_id = %run_id, attempts, "run poll attempts exhausted");
            return Err(AppError::incomplete(
                "assistant run did not finish within the poll attempt limit",
            ));
        }

        tokio::select! {
            () = tokio::time::sleep(tuning.run_poll_interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Err(AppError::incomplete("assistant run polling was cancelled"));
                }
            }
        }
    }
}

/// Run the legacy flow end to end as a normalized event stream.
///
/// Message deltas stream out as they arrive. Once the run stream closes,
/// the terminal status is confirmed by polling; a run that completed
/// without streaming any text (some gateways buffer the whole reply) falls
/// back to reading the final assistant message.
pub(super) fn run_events(
    client: AzureOpenAiClient,
    spec: AssistantRunSpec,
    tuning: RelayTuning,
    mut cancel: watch::Receiver<bool>,
    key: Option<String>,
    identity: ForwardedIdentity,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let key = key.as_deref();

        let assistant_id = match spec.assistant_id.clone() {
            Some(id) => id,
            None => match create_assistant(&client, &spec.model, key, &identity).await {
                Ok(id) => id,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            },
        };

        let thread_id = match create_thread(&client, &spec, key, &identity).await {
            Ok(id) => id,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let run_request = RunRequest {
            assistant_id: &assistant_id,
            instructions: &spec.instructions,
            temperature: spec.temperature,
            stream: true,
        };
        let response = match client
            .post_stream(
                &format!("threads/{thread_id}/runs"),
                &run_request,
                key,
                &identity,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut lines = SseLineBuffer::new();
        let byte_stream = response.bytes_stream();
        tokio::pin!(byte_stream);

        let mut run_id: Option<String> = None;
        let mut streamed_text = false;

        'read: while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(AppError::transport(format!(
                        "upstream stream read failed: {e}"
                    )));
                    return;
                }
            };
            for event in lines.feed(&bytes) {
                match event {
                    SseEvent::Data(payload) => {
                        let value = match serde_json::from_str::<Value>(&payload) {
                            Ok(value) => value,
                            Err(e) => {
                                yield Err(AppError::transport(format!(
                                    "malformed stream payload: {e}"
                                )));
                                continue;
                            }
                        };
                        if let Some(run) = run_snapshot(&value) {
                            let failed = run.is_terminal() && !run.is_completed();
                            let message = failed.then(|| run.failure_message());
                            run_id = Some(run.id);
                            if let Some(message) = message {
                                yield Ok(StreamEvent::Error { message });
                                return;
                            }
                            continue;
                        }
                        if let Some(event) = stream_event(&value) {
                            if let StreamEvent::Text { ref delta, .. } = event {
                                if !delta.is_empty() {
                                    streamed_text = true;
                                }
                            }
                            yield Ok(event);
                        }
                    }
                    SseEvent::Done => break 'read,
                }
            }
        }

        let Some(run_id) = run_id else {
            yield Err(AppError::upstream("run was never acknowledged on the stream"));
            return;
        };

        match wait_for_run(&client, &thread_id, &run_id, &tuning, &mut cancel, key, &identity).await {
            Ok(run) if run.is_completed() => {
                if !streamed_text {
                    match client
                        .get_json(&format!("threads/{thread_id}/messages"), key, &identity)
                        .await
                    {
                        Ok(listing) => {
                            if let Some(event) = assistant_message_event(&listing) {
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                yield Ok(StreamEvent::End);
            }
            Ok(run) => {
                yield Ok(StreamEvent::Error {
                    message: run.failure_message(),
                });
            }
            Err(e) => {
                yield Err(e);
            }
        }
    })
}
