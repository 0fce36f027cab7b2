// ABOUTME: Environment-driven configuration for the relay server and its upstream connection
// ABOUTME: Covers listen port, upstream credentials/endpoints, chat defaults, and relay tuning knobs
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Server Configuration
//!
//! Environment-only configuration. Every knob has a default that matches the
//! reference deployment, so a bare `ServerConfig::from_env()` produces a
//! runnable development setup pointed at the public `OpenAI` endpoint.

use crate::constants::{defaults, limits};
use crate::errors::{AppError, AppResult};
use std::env;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Which provider API surface the relay talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    /// Azure OpenAI (`{host}/openai/v1/...` with an `api-version` query)
    Azure,
    /// OpenAI (`{host}/v1/...`)
    OpenAi,
}

impl ApiType {
    fn parse(value: &str) -> AppResult<Self> {
        match value {
            "azure" => Ok(Self::Azure),
            "openai" => Ok(Self::OpenAi),
            other => Err(AppError::config(format!(
                "OPENAI_API_TYPE must be 'azure' or 'openai', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Azure => write!(f, "azure"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

/// Upstream endpoint and credential configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Provider host, e.g. `https://my-resource.openai.azure.com`
    pub host: String,
    /// Provider API surface
    pub api_type: ApiType,
    /// Azure `api-version` query value
    pub api_version: String,
    /// Static API key (Azure key or `OpenAI` secret key)
    pub api_key: Option<String>,
    /// `OpenAI` organization id, sent as a scoping header when present
    pub organization: Option<String>,
    /// Use a managed-identity bearer token instead of the static Azure key
    pub use_managed_identity: bool,
    /// Route through an API-management gateway (adds the subscription header)
    pub apim_enabled: bool,
    /// API-management subscription key
    pub apim_key: Option<String>,
}

/// Defaults applied to inbound chat requests
#[derive(Debug, Clone)]
pub struct ChatDefaults {
    /// System prompt used when the client sends none
    pub system_prompt: String,
    /// Sampling temperature used when the client sends none
    pub temperature: f32,
    /// Model used for assistant provisioning
    pub model_id: String,
    /// Model the deep health probe exercises
    pub probe_model_id: String,
}

/// Tuning knobs for the stream relay and the assistant-run poller
#[derive(Debug, Clone)]
pub struct RelayTuning {
    /// Chunks to hold once an unfinished citation sentinel is observed
    pub citation_hold_chunks: u32,
    /// Hard timeout on the citation hold window
    pub citation_hold_timeout: Duration,
    /// Interval between assistant-run status polls
    pub run_poll_interval: Duration,
    /// Maximum poll attempts before giving up (`None` = unbounded)
    pub run_poll_max_attempts: Option<u32>,
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub http_port: u16,
    /// Upstream endpoint and credentials
    pub upstream: UpstreamConfig,
    /// Chat request defaults
    pub chat: ChatDefaults,
    /// Relay tuning
    pub relay: RelayTuning,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is present but
    /// unparseable, or when the selected credential scheme is incomplete.
    pub fn from_env() -> AppResult<Self> {
        let api_type = ApiType::parse(&env_string("OPENAI_API_TYPE", "openai"))?;

        let upstream = UpstreamConfig {
            host: env_string("OPENAI_API_HOST", defaults::API_HOST),
            api_type,
            api_version: env_string("OPENAI_API_VERSION", defaults::API_VERSION),
            api_key: env_optional("OPENAI_API_KEY"),
            organization: env_optional("OPENAI_ORGANIZATION"),
            use_managed_identity: env_flag("AZURE_USE_MANAGED_IDENTITY"),
            apim_enabled: env_flag("AZURE_APIM"),
            apim_key: env_optional("AZURE_APIM_KEY"),
        };
        upstream.validate()?;

        let chat = ChatDefaults {
            system_prompt: env_string("DEFAULT_SYSTEM_PROMPT", defaults::SYSTEM_PROMPT),
            temperature: env_parse("DEFAULT_TEMPERATURE", defaults::TEMPERATURE)?,
            model_id: env_string("DEFAULT_MODEL", defaults::MODEL_ID),
            probe_model_id: env_string("HEALTH_PROBE_MODEL", defaults::PROBE_MODEL_ID),
        };

        let relay = RelayTuning {
            citation_hold_chunks: env_parse("CITATION_HOLD_CHUNKS", limits::CITATION_HOLD_CHUNKS)?,
            citation_hold_timeout: Duration::from_secs(env_parse(
                "CITATION_HOLD_TIMEOUT_SECS",
                limits::CITATION_HOLD_TIMEOUT_SECS,
            )?),
            run_poll_interval: Duration::from_secs(env_parse(
                "RUN_POLL_INTERVAL_SECS",
                limits::RUN_POLL_INTERVAL_SECS,
            )?),
            run_poll_max_attempts: match env_parse("RUN_POLL_MAX_ATTEMPTS", 0u32)? {
                0 => None,
                n => Some(n),
            },
        };

        Ok(Self {
            http_port: env_parse("HTTP_PORT", defaults::HTTP_PORT)?,
            upstream,
            chat,
            relay,
        })
    }

    /// One-line startup summary with secrets redacted
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "port={} upstream={} ({}) api_version={} managed_identity={} apim={} default_model={}",
            self.http_port,
            self.upstream.host,
            self.upstream.api_type,
            self.upstream.api_version,
            self.upstream.use_managed_identity,
            self.upstream.apim_enabled,
            self.chat.model_id,
        )
    }
}

impl UpstreamConfig {
    /// Check the host parses as an http(s) URL and the selected credential
    /// scheme is usable
    fn validate(&self) -> AppResult<()> {
        let host = Url::parse(&self.host)
            .map_err(|e| AppError::config(format!("OPENAI_API_HOST is not a valid URL: {e}")))?;
        if !matches!(host.scheme(), "http" | "https") {
            return Err(AppError::config(
                "OPENAI_API_HOST must use the http or https scheme",
            ));
        }

        match self.api_type {
            ApiType::OpenAi if self.api_key.is_none() => Err(AppError::new(
                crate::errors::ErrorCode::ConfigMissing,
                "OPENAI_API_KEY is required when OPENAI_API_TYPE=openai",
            )),
            ApiType::Azure
                if !self.use_managed_identity && self.api_key.is_none() && !self.apim_enabled =>
            {
                Err(AppError::new(
                    crate::errors::ErrorCode::ConfigMissing,
                    "Azure upstream needs OPENAI_API_KEY, AZURE_USE_MANAGED_IDENTITY, or AZURE_APIM",
                ))
            }
            _ => Ok(()),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Truthy when set to anything but an empty string, `false`, or `0`
fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| !v.is_empty() && v != "false" && v != "0")
        .unwrap_or(false)
}

fn env_parse<T>(key: &str, default: T) -> AppResult<T>
where
    T: std::str::FromStr,
{
    match env_optional(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::config(format!("{key} has an unparseable value: '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "OPENAI_API_HOST",
            "OPENAI_API_TYPE",
            "OPENAI_API_VERSION",
            "OPENAI_API_KEY",
            "OPENAI_ORGANIZATION",
            "AZURE_USE_MANAGED_IDENTITY",
            "AZURE_APIM",
            "AZURE_APIM_KEY",
            "DEFAULT_SYSTEM_PROMPT",
            "DEFAULT_TEMPERATURE",
            "DEFAULT_MODEL",
            "HEALTH_PROBE_MODEL",
            "CITATION_HOLD_CHUNKS",
            "CITATION_HOLD_TIMEOUT_SECS",
            "RUN_POLL_INTERVAL_SECS",
            "RUN_POLL_MAX_ATTEMPTS",
            "HTTP_PORT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_with_key() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "sk-test");

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.upstream.api_type, ApiType::OpenAi);
        assert_eq!(config.upstream.host, "https://api.openai.com");
        assert!((config.chat.temperature - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.relay.citation_hold_chunks, 50);
        assert_eq!(config.relay.run_poll_interval, Duration::from_secs(2));
        assert!(config.relay.run_poll_max_attempts.is_none());
    }

    #[test]
    #[serial]
    fn test_azure_managed_identity() {
        clear_env();
        std::env::set_var("OPENAI_API_TYPE", "azure");
        std::env::set_var("OPENAI_API_HOST", "https://res.openai.azure.com");
        std::env::set_var("AZURE_USE_MANAGED_IDENTITY", "true");
        std::env::set_var("RUN_POLL_MAX_ATTEMPTS", "30");

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.upstream.api_type, ApiType::Azure);
        assert!(config.upstream.use_managed_identity);
        assert_eq!(config.relay.run_poll_max_attempts, Some(30));
    }

    #[test]
    #[serial]
    fn test_azure_without_credentials_is_rejected() {
        clear_env();
        std::env::set_var("OPENAI_API_TYPE", "azure");

        let err = ServerConfig::from_env().unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ConfigMissing);
    }

    #[test]
    #[serial]
    fn test_unknown_api_type_is_rejected() {
        clear_env();
        std::env::set_var("OPENAI_API_TYPE", "bedrock");

        let err = ServerConfig::from_env().unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ConfigError);
    }

    #[test]
    #[serial]
    fn test_malformed_host_is_rejected() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        std::env::set_var("OPENAI_API_HOST", "not a url");
        assert!(ServerConfig::from_env().is_err());

        std::env::set_var("OPENAI_API_HOST", "ftp://api.openai.com");
        let err = ServerConfig::from_env().unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ConfigError);
    }

    #[test]
    #[serial]
    fn test_flag_parsing() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        std::env::set_var("AZURE_APIM", "false");
        assert!(!ServerConfig::from_env().unwrap().upstream.apim_enabled);

        std::env::set_var("AZURE_APIM", "1");
        assert!(ServerConfig::from_env().unwrap().upstream.apim_enabled);
    }
}
