// ABOUTME: Unified error handling with standard error codes and HTTP response formatting
// ABOUTME: Covers the upstream/transport/authorization/incomplete taxonomy plus ambient error kinds
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Unified Error Handling System
//!
//! This module provides a centralized error handling system for the chatstream
//! relay. It defines standard error types, error codes, and HTTP response
//! formatting to ensure consistent error handling across all modules and APIs.
//!
//! Every failure from the three upstream call-shape branches is normalized to
//! one of these codes before it reaches the stream relay; the relay and the
//! route handlers never see provider-specific error shapes.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Standard error codes used throughout the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Authentication & Authorization (1000-1999)
    /// Authentication is required but missing
    #[serde(rename = "AUTH_REQUIRED")]
    AuthRequired = 1000,
    /// Provided credentials are invalid
    #[serde(rename = "AUTH_INVALID")]
    AuthInvalid = 1001,
    /// Authenticated user is not allowed to use the referenced resource
    #[serde(rename = "PERMISSION_DENIED")]
    PermissionDenied = 1002,

    // Validation (3000-3999)
    /// Request payload failed validation
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput = 3000,
    /// A required field is missing
    #[serde(rename = "MISSING_REQUIRED_FIELD")]
    MissingRequiredField = 3001,

    // Resource Management (4000-4999)
    /// Referenced resource does not exist
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound = 4000,

    // Upstream provider (5000-5999)
    /// Provider returned a non-2xx status or a structured error envelope
    #[serde(rename = "UPSTREAM_PROVIDER_ERROR")]
    UpstreamProvider = 5000,
    /// Provider stream broke or produced an undecodable frame mid-flight
    #[serde(rename = "STREAM_TRANSPORT_ERROR")]
    StreamTransport = 5001,
    /// Provider explicitly reported the generation as failed or incomplete
    #[serde(rename = "INCOMPLETE_GENERATION")]
    IncompleteGeneration = 5002,

    // Configuration (6000-6999)
    /// Configuration error encountered
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError = 6000,
    /// Required configuration is missing
    #[serde(rename = "CONFIG_MISSING")]
    ConfigMissing = 6001,

    // Internal Errors (9000-9999)
    /// Unexpected internal failure
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError = 9000,
    /// Data serialization/deserialization failed
    #[serde(rename = "SERIALIZATION_ERROR")]
    SerializationError = 9001,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> u16 {
        match self {
            // 400 Bad Request
            ErrorCode::InvalidInput | ErrorCode::MissingRequiredField => 400,

            // 401 Unauthorized
            ErrorCode::AuthRequired | ErrorCode::AuthInvalid => 401,

            // 403 Forbidden
            ErrorCode::PermissionDenied => 403,

            // 404 Not Found
            ErrorCode::ResourceNotFound => 404,

            // 500 Internal Server Error. Upstream failures are deliberately
            // surfaced as 500 rather than 502: the browser client treats any
            // non-200 as "the relay failed" and renders the body verbatim.
            ErrorCode::UpstreamProvider
            | ErrorCode::StreamTransport
            | ErrorCode::IncompleteGeneration
            | ErrorCode::ConfigError
            | ErrorCode::ConfigMissing
            | ErrorCode::InternalError
            | ErrorCode::SerializationError => 500,
        }
    }

    /// Get a user-friendly description of this error
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "Authentication is required to access this resource",
            ErrorCode::AuthInvalid => "The provided authentication credentials are invalid",
            ErrorCode::PermissionDenied => "You do not have permission to perform this action",
            ErrorCode::InvalidInput => "The provided input is invalid",
            ErrorCode::MissingRequiredField => "A required field is missing from the request",
            ErrorCode::ResourceNotFound => "The requested resource was not found",
            ErrorCode::UpstreamProvider => "The model provider returned an error",
            ErrorCode::StreamTransport => "The model provider stream failed mid-flight",
            ErrorCode::IncompleteGeneration => "The model provider reported the response as incomplete",
            ErrorCode::ConfigError => "Configuration error encountered",
            ErrorCode::ConfigMissing => "Required configuration is missing",
            ErrorCode::InternalError => "An internal server error occurred",
            ErrorCode::SerializationError => "Data serialization/deserialization failed",
        }
    }
}

/// Additional context that can be attached to errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Request ID for tracing
    pub request_id: Option<String>,
    /// Requesting principal name if available
    pub user_name: Option<String>,
    /// Resource ID if applicable (vector store, assistant, file, run)
    pub resource_id: Option<String>,
    /// Additional key-value context
    pub details: serde_json::Value,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            request_id: None,
            user_name: None,
            resource_id: None,
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Unified error type for the application
#[derive(Debug, Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context
    pub context: ErrorContext,
    /// Source error for error chaining
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Add a request ID to the error context
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.context.request_id = Some(request_id.into());
        self
    }

    /// Add the requesting principal to the error context
    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.context.user_name = Some(user_name.into());
        self
    }

    /// Add a resource ID to the error context
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.context.resource_id = Some(resource_id.into());
        self
    }

    /// Add details to the error context
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.context.details = details;
        self
    }

    /// Add a source error for error chaining
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// HTTP error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error payload
    pub error: ErrorResponseDetails,
}

/// Body of the HTTP error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponseDetails {
    /// Stable machine-readable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Request ID when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Structured context details
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        Self {
            error: ErrorResponseDetails {
                code: error.code,
                message: error.message,
                request_id: error.context.request_id,
                details: error.context.details,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::error!(code = ?self.code, status = status.as_u16(), "{}", self.message);
        (status, Json(ErrorResponse::from(self))).into_response()
    }
}

/// Convenience functions for creating common errors
impl AppError {
    /// Authentication required
    pub fn auth_required() -> Self {
        Self::new(ErrorCode::AuthRequired, "Authentication required")
    }

    /// Invalid authentication
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthInvalid, message)
    }

    /// Authorization failure: the token's embedded user does not match the
    /// requesting user, or the user may not touch the referenced store
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    /// Invalid input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Missing required field
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("Missing required field: {}", field.into()),
        )
    }

    /// Resource not found
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} not found", resource.into()),
        )
    }

    /// Structured provider error. The envelope fields (`type`, `param`,
    /// `code`) ride along in the context details when the provider sent them.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamProvider, message)
    }

    /// Mid-stream decode/transport failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StreamTransport, message)
    }

    /// Upstream reported the generation as failed or incomplete
    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::IncompleteGeneration, reason)
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationError, message)
    }
}

/// Conversion from `anyhow::Error` for binary-boundary code
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        match error.source() {
            Some(source) => AppError::new(ErrorCode::InternalError, error.to_string())
                .with_details(serde_json::json!({
                    "source": source.to_string()
                })),
            None => AppError::new(ErrorCode::InternalError, error.to_string()),
        }
    }
}

/// Transport-level client failures map onto the stream-transport code
impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::new(ErrorCode::StreamTransport, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::new(ErrorCode::SerializationError, error.to_string()).with_source(error)
    }
}
