// ABOUTME: HTTP client for the upstream provider across both API flavors
// ABOUTME: URL building, credential headers, error envelope mapping, multipart upload
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{multipart, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, instrument};

use crate::auth::{upstream_headers, CachedTokenProvider, ForwardedIdentity};
use crate::config::{ApiType, UpstreamConfig};
use crate::errors::{AppError, AppResult};

/// Connection timeout. No overall request timeout is set because relayed
/// streams legitimately stay open for minutes.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Client for the provider's chat, responses, assistants, and files
/// endpoints. Cheap to clone; the underlying connection pool is shared.
#[derive(Clone)]
pub struct AzureOpenAiClient {
    http: Client,
    upstream: UpstreamConfig,
    tokens: Arc<CachedTokenProvider>,
}

impl AzureOpenAiClient {
    /// Create a client for the configured upstream
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(upstream: UpstreamConfig, tokens: Arc<CachedTokenProvider>) -> AppResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            upstream,
            tokens,
        })
    }

    async fn request_headers(
        &self,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<reqwest::header::HeaderMap> {
        upstream_headers(&self.upstream, &self.tokens, key, identity).await
    }

    /// POST a JSON body and return the checked response for streaming reads
    #[instrument(skip(self, body, key, identity), fields(path = %path))]
    pub(super) async fn post_stream<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<Response> {
        let headers = self.request_headers(key, identity).await?;
        debug!("sending upstream request");
        let response = self
            .http
            .post(api_url(&self.upstream, path))
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::transport(format!("upstream request failed: {e}")))?;
        check_status(response).await
    }

    /// POST a JSON body and parse the JSON response
    pub(super) async fn post_json<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<Value> {
        let response = self.post_stream(path, body, key, identity).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::upstream(format!("invalid upstream response body: {e}")))
    }

    /// GET a resource and parse the JSON response
    #[instrument(skip(self, key, identity), fields(path = %path))]
    pub(super) async fn get_json(
        &self,
        path: &str,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<Value> {
        let headers = self.request_headers(key, identity).await?;
        let response = self
            .http
            .get(api_url(&self.upstream, path))
            .headers(headers)
            .send()
            .await
            .map_err(|e| AppError::transport(format!("upstream request failed: {e}")))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::upstream(format!("invalid upstream response body: {e}")))
    }

    /// Upload one file for assistant use and return its provider id
    #[instrument(skip(self, bytes, key, identity), fields(filename = %filename, size = bytes.len()))]
    pub(super) async fn upload_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<String> {
        let mut headers = self.request_headers(key, identity).await?;
        // The multipart boundary sets its own content type.
        headers.remove(CONTENT_TYPE);

        let part = multipart::Part::bytes(bytes).file_name(filename.to_owned());
        let form = multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let response = self
            .http
            .post(api_url(&self.upstream, "files"))
            .headers(headers)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::transport(format!("file upload failed: {e}")))?;
        let response = check_status(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| AppError::upstream(format!("invalid upstream response body: {e}")))?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::upstream("file upload response is missing an id"))
    }

    /// Model ids visible on the provider account. Azure accounts list
    /// deployments, where the deployed model name identifies the entry;
    /// `OpenAI` accounts list models directly.
    pub(super) async fn list_model_ids(
        &self,
        key: Option<&str>,
        identity: &ForwardedIdentity,
    ) -> AppResult<Vec<String>> {
        let url = match self.upstream.api_type {
            ApiType::Azure => deployments_url(&self.upstream),
            ApiType::OpenAi => api_url(&self.upstream, "models"),
        };
        let headers = self.request_headers(key, identity).await?;
        let response = self
            .http
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| AppError::transport(format!("upstream request failed: {e}")))?;
        let response = check_status(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| AppError::upstream(format!("invalid upstream response body: {e}")))?;
        Ok(model_ids_from_listing(&value))
    }
}

/// Resource URL on the provider's v1 surface
fn api_url(upstream: &UpstreamConfig, path: &str) -> String {
    let host = upstream.host.trim_end_matches('/');
    match upstream.api_type {
        ApiType::Azure => format!(
            "{host}/openai/v1/{path}?api-version={}",
            upstream.api_version
        ),
        ApiType::OpenAi => format!("{host}/v1/{path}"),
    }
}

/// Deployment listing URL, which predates the unified v1 surface
fn deployments_url(upstream: &UpstreamConfig) -> String {
    let host = upstream.host.trim_end_matches('/');
    format!(
        "{host}/openai/deployments?api-version={}",
        upstream.api_version
    )
}

/// Extract model ids from either listing shape, preferring the deployed
/// model name over the deployment id when both are present
fn model_ids_from_listing(value: &Value) -> Vec<String> {
    value
        .get("data")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .get("model")
                        .or_else(|| entry.get("id"))
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Map a non-success response into a typed upstream error, consuming the
/// body. The provider error envelope is used when it parses; otherwise the
/// raw status and a body snippet are reported.
async fn check_status(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, "upstream returned an error");
    Err(upstream_error(status, &body))
}

fn upstream_error(status: StatusCode, body: &str) -> AppError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let detail = envelope.error;
            let message = detail
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("upstream returned {status}"));
            AppError::upstream(message).with_details(json!({
                "status": status.as_u16(),
                "type": detail.kind,
                "param": detail.param,
                "code": detail.code,
            }))
        }
        Err(_) => {
            let snippet: String = body.chars().take(200).collect();
            AppError::upstream(format!("upstream returned {status}: {snippet}"))
        }
    }
}

/// Provider error envelope
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    param: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}
