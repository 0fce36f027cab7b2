// ABOUTME: Upstream credential handling for Azure and OpenAI endpoints
// ABOUTME: Caches managed-identity tokens and assembles per-request auth headers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Upstream Authentication
//!
//! Three credential schemes are supported: a static `api-key` header for
//! Azure, a managed-identity bearer token fetched from the instance metadata
//! service and cached until shortly before expiry, and a plain bearer key for
//! direct `OpenAI`. An APIM subscription key and the App Service client
//! principal headers ride along independently of the scheme.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ApiType, UpstreamConfig};
use crate::constants::headers;
use crate::errors::{AppError, AppResult};

/// Token audience for Azure `OpenAI` calls
const COGNITIVE_SERVICES_RESOURCE: &str = "https://cognitiveservices.azure.com";

/// Instance metadata service endpoint used on plain Azure VMs
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Refresh this long before the reported expiry
const REFRESH_SKEW_SECS: i64 = 60;

/// A bearer token with its expiry
#[derive(Debug, Clone)]
pub struct BearerToken {
    /// The raw token value
    pub token: String,
    /// When the token stops being valid
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    /// Whether the token is expired or within the refresh skew of expiring
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.expires_at - Duration::seconds(REFRESH_SKEW_SECS) <= Utc::now()
    }
}

/// Source of managed-identity bearer tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a fresh token
    async fn fetch(&self) -> AppResult<BearerToken>;
}

/// Token source backed by the Azure instance metadata service. App Service
/// and Container Apps expose the same contract through `IDENTITY_ENDPOINT`
/// with a per-instance secret header.
pub struct ImdsTokenSource {
    http: reqwest::Client,
    endpoint: String,
    identity_header: Option<String>,
    resource: String,
}

impl ImdsTokenSource {
    /// Create a source for an explicit endpoint
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        identity_header: Option<String>,
        resource: String,
    ) -> Self {
        Self {
            http,
            endpoint,
            identity_header,
            resource,
        }
    }

    /// Create a source from the ambient environment, preferring the App
    /// Service identity endpoint over the fixed VM metadata address
    #[must_use]
    pub fn from_env(http: reqwest::Client) -> Self {
        let endpoint = std::env::var("IDENTITY_ENDPOINT")
            .unwrap_or_else(|_| IMDS_TOKEN_ENDPOINT.to_owned());
        let identity_header = std::env::var("IDENTITY_HEADER").ok();
        Self::new(
            http,
            endpoint,
            identity_header,
            COGNITIVE_SERVICES_RESOURCE.to_owned(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// Unix seconds, sent as a string by some metadata service versions
    expires_on: Option<serde_json::Value>,
    expires_in: Option<serde_json::Value>,
}

/// The metadata service reports epochs as either numbers or decimal strings
fn parse_epoch_field(value: Option<&serde_json::Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[async_trait]
impl TokenSource for ImdsTokenSource {
    async fn fetch(&self) -> AppResult<BearerToken> {
        let api_version = if self.identity_header.is_some() {
            "2019-08-01"
        } else {
            "2018-02-01"
        };
        let mut request = self.http.get(&self.endpoint).query(&[
            ("resource", self.resource.as_str()),
            ("api-version", api_version),
        ]);
        request = match &self.identity_header {
            Some(secret) => request.header("X-IDENTITY-HEADER", secret),
            None => request.header("Metadata", "true"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AppError::auth_invalid(format!("identity endpoint unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::auth_invalid(format!(
                "identity endpoint returned {status}: {body}"
            )));
        }

        let token: ImdsTokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::auth_invalid(format!("malformed identity response: {e}")))?;

        let expires_at = parse_epoch_field(token.expires_on.as_ref())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                parse_epoch_field(token.expires_in.as_ref())
                    .map(|secs| Utc::now() + Duration::seconds(secs))
            })
            .unwrap_or_else(|| Utc::now() + Duration::minutes(5));

        Ok(BearerToken {
            token: token.access_token,
            expires_at,
        })
    }
}

/// Caches the current managed-identity token in process memory and refreshes
/// it lazily when a caller needs one that is about to expire
pub struct CachedTokenProvider {
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<BearerToken>>,
}

impl CachedTokenProvider {
    /// Wrap a token source with a cache
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token value, refreshed if stale
    pub async fn bearer(&self) -> AppResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.source.fetch().await?;
        debug!(expires_at = %fresh.expires_at, "refreshed managed identity token");
        let value = fresh.token.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

/// Client principal headers injected by App Service authentication, passed
/// through to the upstream so APIM policies can see the end user
#[derive(Debug, Clone, Default)]
pub struct ForwardedIdentity {
    /// `x-ms-client-principal-name`
    pub principal_name: Option<String>,
    /// `x-ms-client-principal`
    pub principal: Option<String>,
    /// `x-ms-client-principal-id`
    pub principal_id: Option<String>,
}

impl ForwardedIdentity {
    /// Extract the principal headers from an incoming request
    #[must_use]
    pub fn from_headers(incoming: &HeaderMap) -> Self {
        let text = |name: &str| {
            incoming
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        };
        Self {
            principal_name: text(headers::CLIENT_PRINCIPAL_NAME),
            principal: text(headers::CLIENT_PRINCIPAL),
            principal_id: text(headers::CLIENT_PRINCIPAL_ID),
        }
    }

    /// Display name for audit records
    #[must_use]
    pub fn user_name(&self) -> &str {
        self.principal_name.as_deref().unwrap_or_default()
    }
}

fn header_value(name: &str, value: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| AppError::config(format!("value for header {name} is not valid ASCII")))
}

/// Assemble the upstream request headers for the configured credential
/// scheme. A non-empty per-request key overrides the configured one.
pub async fn upstream_headers(
    upstream: &UpstreamConfig,
    tokens: &CachedTokenProvider,
    request_key: Option<&str>,
    identity: &ForwardedIdentity,
) -> AppResult<HeaderMap> {
    let mut headers_out = HeaderMap::new();
    headers_out.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let key = request_key
        .filter(|k| !k.is_empty())
        .or(upstream.api_key.as_deref());

    match upstream.api_type {
        ApiType::OpenAi => {
            let key = key.ok_or_else(|| AppError::config("no OpenAI API key available"))?;
            headers_out.insert(
                AUTHORIZATION,
                header_value("authorization", &format!("Bearer {key}"))?,
            );
            if let Some(org) = &upstream.organization {
                headers_out.insert(headers::OPENAI_ORGANIZATION, header_value("organization", org)?);
            }
        }
        ApiType::Azure => {
            if upstream.use_managed_identity {
                let token = tokens.bearer().await?;
                headers_out.insert(
                    AUTHORIZATION,
                    header_value("authorization", &format!("Bearer {token}"))?,
                );
            } else {
                let key = key.ok_or_else(|| AppError::config("no Azure API key available"))?;
                headers_out.insert(headers::AZURE_API_KEY, header_value("api-key", key)?);
            }
        }
    }

    if upstream.apim_enabled {
        let apim_key = upstream
            .apim_key
            .as_deref()
            .ok_or_else(|| AppError::config("APIM is enabled but no subscription key is set"))?;
        headers_out.insert(
            headers::APIM_SUBSCRIPTION_KEY,
            header_value("apim subscription key", apim_key)?,
        );
    }

    if let Some(name) = &identity.principal_name {
        headers_out.insert(headers::CLIENT_PRINCIPAL_NAME, header_value("principal name", name)?);
    }
    if let Some(principal) = &identity.principal {
        headers_out.insert(headers::CLIENT_PRINCIPAL, header_value("principal", principal)?);
    }
    if let Some(id) = &identity.principal_id {
        headers_out.insert(headers::CLIENT_PRINCIPAL_ID, header_value("principal id", id)?);
    }

    Ok(headers_out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
        ttl_secs: i64,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> AppResult<BearerToken> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BearerToken {
                token: format!("token-{call}"),
                expires_at: Utc::now() + Duration::seconds(self.ttl_secs),
            })
        }
    }

    fn azure_config() -> UpstreamConfig {
        UpstreamConfig {
            host: "https://example.openai.azure.com".into(),
            api_type: ApiType::Azure,
            api_version: "2024-12-01-preview".into(),
            api_key: Some("cfg-key".into()),
            organization: None,
            use_managed_identity: false,
            apim_enabled: false,
            apim_key: None,
        }
    }

    #[tokio::test]
    async fn test_cached_token_is_reused_until_skew() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        });
        let provider = CachedTokenProvider::new(source.clone());

        assert_eq!(provider.bearer().await.unwrap(), "token-1");
        assert_eq!(provider.bearer().await.unwrap(), "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_within_skew_is_refreshed() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 10,
        });
        let provider = CachedTokenProvider::new(source.clone());

        assert_eq!(provider.bearer().await.unwrap(), "token-1");
        assert_eq!(provider.bearer().await.unwrap(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_azure_key_scheme() {
        let provider = CachedTokenProvider::new(Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        }));
        let headers_out = upstream_headers(
            &azure_config(),
            &provider,
            None,
            &ForwardedIdentity::default(),
        )
        .await
        .unwrap();

        assert_eq!(headers_out.get("api-key").unwrap(), "cfg-key");
        assert!(headers_out.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_request_key_overrides_configured_key() {
        let provider = CachedTokenProvider::new(Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        }));
        let headers_out = upstream_headers(
            &azure_config(),
            &provider,
            Some("user-key"),
            &ForwardedIdentity::default(),
        )
        .await
        .unwrap();

        assert_eq!(headers_out.get("api-key").unwrap(), "user-key");
    }

    #[tokio::test]
    async fn test_empty_request_key_falls_back() {
        let provider = CachedTokenProvider::new(Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        }));
        let headers_out = upstream_headers(
            &azure_config(),
            &provider,
            Some(""),
            &ForwardedIdentity::default(),
        )
        .await
        .unwrap();

        assert_eq!(headers_out.get("api-key").unwrap(), "cfg-key");
    }

    #[tokio::test]
    async fn test_managed_identity_scheme_uses_bearer() {
        let mut config = azure_config();
        config.use_managed_identity = true;
        config.api_key = None;
        let provider = CachedTokenProvider::new(Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        }));

        let headers_out = upstream_headers(
            &config,
            &provider,
            None,
            &ForwardedIdentity::default(),
        )
        .await
        .unwrap();

        assert_eq!(headers_out.get(AUTHORIZATION).unwrap(), "Bearer token-1");
        assert!(headers_out.get("api-key").is_none());
    }

    #[tokio::test]
    async fn test_openai_scheme_with_organization() {
        let config = UpstreamConfig {
            host: "https://api.openai.com".into(),
            api_type: ApiType::OpenAi,
            api_version: String::new(),
            api_key: Some("sk-test".into()),
            organization: Some("org-42".into()),
            use_managed_identity: false,
            apim_enabled: false,
            apim_key: None,
        };
        let provider = CachedTokenProvider::new(Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        }));

        let headers_out = upstream_headers(
            &config,
            &provider,
            None,
            &ForwardedIdentity::default(),
        )
        .await
        .unwrap();

        assert_eq!(headers_out.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(headers_out.get("OpenAI-Organization").unwrap(), "org-42");
    }

    #[tokio::test]
    async fn test_apim_and_identity_headers_ride_along() {
        let mut config = azure_config();
        config.apim_enabled = true;
        config.apim_key = Some("apim-secret".into());
        let provider = CachedTokenProvider::new(Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            ttl_secs: 3600,
        }));
        let identity = ForwardedIdentity {
            principal_name: Some("jordan@example.gov".into()),
            principal: Some("b64-blob".into()),
            principal_id: Some("aad-object-id".into()),
        };

        let headers_out = upstream_headers(&config, &provider, None, &identity)
            .await
            .unwrap();

        assert_eq!(
            headers_out.get("Ocp-Apim-Subscription-Key").unwrap(),
            "apim-secret"
        );
        assert_eq!(
            headers_out.get("x-ms-client-principal-name").unwrap(),
            "jordan@example.gov"
        );
        assert_eq!(
            headers_out.get("x-ms-client-principal-id").unwrap(),
            "aad-object-id"
        );
    }

    #[test]
    fn test_epoch_parsing_accepts_strings_and_numbers() {
        assert_eq!(
            parse_epoch_field(Some(&serde_json::json!(1_750_000_000))),
            Some(1_750_000_000)
        );
        assert_eq!(
            parse_epoch_field(Some(&serde_json::json!("1750000000"))),
            Some(1_750_000_000)
        );
        assert_eq!(parse_epoch_field(Some(&serde_json::json!("soon"))), None);
        assert_eq!(parse_epoch_field(None), None);
    }

    #[test]
    fn test_forwarded_identity_extraction() {
        let mut incoming = HeaderMap::new();
        incoming.insert(
            "x-ms-client-principal-name",
            HeaderValue::from_static("sam@example.gov"),
        );
        let identity = ForwardedIdentity::from_headers(&incoming);
        assert_eq!(identity.user_name(), "sam@example.gov");
        assert!(identity.principal_id.is_none());

        let empty = ForwardedIdentity::default();
        assert_eq!(empty.user_name(), "");
    }
}
