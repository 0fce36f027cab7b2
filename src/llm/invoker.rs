// ABOUTME: Orchestrates one chat exchange into the right upstream call shape
// ABOUTME: Token resolution, message preparation, temperature rules, file uploads
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Upstream Invoker
//!
//! The invoker owns everything that has to happen between "a request was
//! accepted" and "a normalized event stream is flowing": resolving opaque
//! vector-store tokens against the requesting user, flattening the
//! newest-first history into provider order, applying the model alias and
//! temperature rules, uploading inline file attachments, and finally
//! opening the completions, responses, or assistant-run call.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::watch;
use tracing::{debug, instrument};

use super::assistants::{self, AssistantRunSpec};
use super::client::AzureOpenAiClient;
use super::completions::{self, CompletionsRequest};
use super::responses::{self, ResponsesRequest, ToolSpec};
use super::{
    CallShape, ChatRequest, ContentPart, EventStream, MessageRole, ModelRef, PreparedMessage,
    select_call_shape,
};
use crate::auth::ForwardedIdentity;
use crate::citations::FileIdNameMap;
use crate::config::{ChatDefaults, RelayTuning};
use crate::errors::{AppError, AppResult};
use crate::grounding::VectorStoreTokenResolver;
use crate::models::{self, ModelListing};

/// An opened upstream exchange plus the request-shaped data the relay and
/// audit trail need downstream
pub struct InvokedUpstream {
    /// Normalized upstream events
    pub events: EventStream,
    /// File names for citation rewriting, present when a vector store is
    /// in play
    pub file_map: Option<FileIdNameMap>,
    /// The exact messages sent upstream, system prompt included
    pub messages: Vec<PreparedMessage>,
    /// Temperature actually sent, `None` for models that reject one
    pub temperature: Option<f32>,
    /// Display name of the invoked model
    pub model_name: String,
}

/// Ids created by grounding provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedIds {
    /// File-search assistant id
    pub assistant_id: String,
    /// Expiring vector store id
    pub vector_store_id: String,
}

/// Binds the provider client, vector-store token resolver, and chat
/// defaults into the single entry point the routes call
pub struct UpstreamInvoker {
    client: AzureOpenAiClient,
    resolver: Arc<dyn VectorStoreTokenResolver>,
    defaults: ChatDefaults,
    tuning: RelayTuning,
}

impl UpstreamInvoker {
    /// Create an invoker
    #[must_use]
    pub fn new(
        client: AzureOpenAiClient,
        resolver: Arc<dyn VectorStoreTokenResolver>,
        defaults: ChatDefaults,
        tuning: RelayTuning,
    ) -> Self {
        Self {
            client,
            resolver,
            defaults,
            tuning,
        }
    }

    /// Open the upstream exchange for one chat request.
    ///
    /// The cancellation signal is only consulted by the assistant-run
    /// poller; the streaming shapes stop when their stream is dropped.
    ///
    /// # Errors
    ///
    /// Fails before any stream is opened when the vector-store token does
    /// not resolve for the requesting user, an inline attachment cannot be
    /// uploaded, or the provider rejects the call outright.
    #[instrument(
        skip(self, request, identity, cancel),
        fields(model = %request.conversation.model.id)
    )]
    pub async fn invoke(
        &self,
        request: &ChatRequest,
        identity: &ForwardedIdentity,
        cancel: watch::Receiver<bool>,
    ) -> AppResult<InvokedUpstream> {
        let key = request.key.as_deref();
        let conversation = &request.conversation;

        let deployment = models::deployment_id(&conversation.model.id).to_owned();
        let temperature = effective_temperature(
            &deployment,
            conversation.temperature,
            self.defaults.temperature,
        );
        let model_name = resolve_display_name(&conversation.model);

        let vector_store_id = self.resolve_vector_store(request, identity).await?;
        let shape = select_call_shape(
            request.use_grounding,
            vector_store_id.is_some(),
            request.has_legacy_refs(),
        );
        debug!(shape = ?shape, "selected upstream call shape");

        let messages = prepare_messages(request, &self.defaults.system_prompt);

        match shape {
            CallShape::Completion => {
                let wire = CompletionsRequest {
                    model: deployment,
                    messages: messages.clone(),
                    temperature,
                    stream: true,
                };
                let events = completions::stream(&self.client, &wire, key, identity).await?;
                Ok(InvokedUpstream {
                    events,
                    file_map: None,
                    messages,
                    temperature,
                    model_name,
                })
            }
            CallShape::Responses => {
                let mut tools = Vec::new();
                if request.use_grounding {
                    tools.push(ToolSpec::WebSearch);
                }
                let file_map = match vector_store_id {
                    Some(ref store_id) => {
                        tools.push(ToolSpec::FileSearch {
                            vector_store_ids: vec![store_id.clone()],
                        });
                        Some(
                            assistants::file_id_name_map(&self.client, store_id, key, identity)
                                .await?,
                        )
                    }
                    None => None,
                };
                let wire = ResponsesRequest {
                    model: deployment,
                    input: messages.clone(),
                    temperature,
                    stream: true,
                    tools,
                };
                let events = responses::stream(&self.client, &wire, key, identity).await?;
                Ok(InvokedUpstream {
                    events,
                    file_map,
                    messages,
                    temperature,
                    model_name,
                })
            }
            CallShape::AssistantRun => {
                let attachment_file_ids =
                    self.collect_attachments(request, key, identity).await?;
                let spec = AssistantRunSpec {
                    assistant_id: conversation
                        .assistant_id
                        .clone()
                        .filter(|id| !id.is_empty()),
                    model: deployment,
                    instructions: request
                        .system_prompt_or(&self.defaults.system_prompt)
                        .to_owned(),
                    messages: thread_history(request),
                    attachment_file_ids,
                    temperature,
                };
                let events = assistants::run_events(
                    self.client.clone(),
                    spec,
                    self.tuning.clone(),
                    cancel,
                    request.key.clone(),
                    identity.clone(),
                );
                Ok(InvokedUpstream {
                    events,
                    file_map: None,
                    messages,
                    temperature,
                    model_name,
                })
            }
        }
    }

    /// Create the assistant and vector store a client needs before it can
    /// upload files for grounded chat
    ///
    /// # Errors
    ///
    /// Propagates provider errors from either creation call.
    pub async fn provision_grounding(
        &self,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<ProvisionedIds> {
        let model = models::deployment_id(&self.defaults.model_id);
        let assistant_id =
            assistants::create_assistant(&self.client, model, key, identity).await?;
        let vector_store_id =
            assistants::create_vector_store(&self.client, key, identity).await?;
        Ok(ProvisionedIds {
            assistant_id,
            vector_store_id,
        })
    }

    /// Models visible on the provider account, filtered to the catalog the
    /// client understands
    ///
    /// # Errors
    ///
    /// Propagates provider errors from the listing call.
    pub async fn list_models(
        &self,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<Vec<ModelListing>> {
        let ids = self.client.list_model_ids(key, identity).await?;
        let mut listings: Vec<ModelListing> = Vec::new();
        for id in ids {
            if let Some(spec) = models::find(&id) {
                if !listings.iter().any(|l| l.id == spec.id) {
                    listings.push(ModelListing::from(spec));
                }
            }
        }
        Ok(listings)
    }

    /// Vector store for this request: an opaque token wins over a raw id
    async fn resolve_vector_store(
        &self,
        request: &ChatRequest,
        identity: &ForwardedIdentity,
    ) -> AppResult<Option<String>> {
        let conversation = &request.conversation;
        if let Some(token) = conversation
            .vector_store_jwe
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            let refs = self.resolver.resolve(token, identity.user_name()).await?;
            return Ok(Some(refs.vector_store_id));
        }
        Ok(conversation
            .vector_store_id
            .clone()
            .filter(|id| !id.is_empty()))
    }

    /// Attachment file ids for the legacy flow: ids the client already
    /// uploaded plus uploads of any inline base64 parts, oldest first
    async fn collect_attachments(
        &self,
        request: &ChatRequest,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<Vec<String>> {
        let mut ids: Vec<String> = request
            .conversation
            .file_ids
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect();

        for message in request.conversation.messages.iter().rev() {
            let Some(parts) = message.content_parts() else {
                continue;
            };
            for part in parts {
                let ContentPart::File {
                    file_id,
                    filename,
                    data,
                } = part
                else {
                    continue;
                };
                if let Some(id) = file_id.filter(|id| !id.is_empty()) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                } else if let Some(data) = data {
                    let bytes = decode_inline_data(&data)?;
                    let name = filename.unwrap_or_else(|| "upload.bin".to_owned());
                    let id =
                        assistants::upload_file(&self.client, &name, bytes, key, identity).await?;
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

/// Temperature to send: the request value, falling back to the configured
/// default, suppressed entirely for models that reject the parameter
fn effective_temperature(deployment: &str, requested: Option<f32>, default: f32) -> Option<f32> {
    if models::rejects_temperature(deployment) {
        None
    } else {
        Some(requested.unwrap_or(default))
    }
}

/// Display name for the audit trail: the client-sent name when present,
/// otherwise resolved from the catalog
fn resolve_display_name(model: &ModelRef) -> String {
    model
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| models::display_name(&model.id))
}

/// Provider-ordered messages: the effective system prompt first, then the
/// newest-first history reversed into chronological order. File-upload
/// context rides along as system messages; client timestamps are dropped.
fn prepare_messages(request: &ChatRequest, default_prompt: &str) -> Vec<PreparedMessage> {
    let mut prepared = Vec::with_capacity(request.conversation.messages.len() + 1);
    prepared.push(PreparedMessage::new(
        "system",
        request.system_prompt_or(default_prompt),
    ));
    for message in request.conversation.messages.iter().rev() {
        let role = match message.role {
            MessageRole::System | MessageRole::FileUpload => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        prepared.push(PreparedMessage::new(role, message.content.clone()));
    }
    prepared
}

/// Chronological history for a thread. Threads only accept `user` and
/// `assistant` roles, so everything else flattens to `user`; structured
/// content collapses to its text parts since files travel as attachments.
fn thread_history(request: &ChatRequest) -> Vec<PreparedMessage> {
    request
        .conversation
        .messages
        .iter()
        .rev()
        .map(|message| {
            let role = if message.role == MessageRole::Assistant {
                "assistant"
            } else {
                "user"
            };
            let content = message.content_parts().map_or_else(
                || message.content.clone(),
                |parts| {
                    parts
                        .into_iter()
                        .filter_map(|part| match part {
                            ContentPart::Text { text } => Some(text),
                            ContentPart::File { .. } => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            );
            PreparedMessage::new(role, content)
        })
        .collect()
}

/// Decode an inline base64 attachment, tolerating a data-URL prefix
fn decode_inline_data(data: &str) -> AppResult<Vec<u8>> {
    let payload = data.rsplit_once("base64,").map_or(data, |(_, b64)| b64);
    BASE64
        .decode(payload.trim())
        .map_err(|e| AppError::invalid_input(format!("invalid inline file data: {e}")))
}
