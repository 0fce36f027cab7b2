// ABOUTME: Vector-store token resolution seam for file-search grounding
// ABOUTME: Maps opaque client tokens onto vector store and assistant ids with a user check
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Grounding References
//!
//! Clients may reference a vector store either by raw id or by an opaque
//! encrypted token minted by the document-upload service. The relay never
//! decrypts tokens itself; it hands them to an injected resolver and uses the
//! returned ids. The shipped resolvers cover wiring and tests, real token
//! decryption is the operator's injection point.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};

/// Resolved grounding target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingRefs {
    /// Vector store to search
    pub vector_store_id: String,
    /// Assistant bound to the store, when the token carries one
    pub assistant_id: Option<String>,
}

/// Resolves an opaque vector-store token into grounding references.
///
/// Implementations must reject tokens issued to a different user than the
/// requesting one. An empty `requesting_user` skips that check, matching
/// deployments without gateway authentication.
#[async_trait]
pub trait VectorStoreTokenResolver: Send + Sync {
    /// Resolve `token` on behalf of `requesting_user`
    async fn resolve(&self, token: &str, requesting_user: &str) -> AppResult<GroundingRefs>;
}

struct StaticEntry {
    refs: GroundingRefs,
    user_name: Option<String>,
}

/// Resolver backed by a fixed token table
#[derive(Default)]
pub struct StaticTokenResolver {
    entries: HashMap<String, StaticEntry>,
}

impl StaticTokenResolver {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as resolving to `refs`, optionally bound to a user
    #[must_use]
    pub fn with_entry(
        mut self,
        token: impl Into<String>,
        refs: GroundingRefs,
        user_name: Option<String>,
    ) -> Self {
        self.entries
            .insert(token.into(), StaticEntry { refs, user_name });
        self
    }
}

#[async_trait]
impl VectorStoreTokenResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str, requesting_user: &str) -> AppResult<GroundingRefs> {
        let entry = self
            .entries
            .get(token)
            .ok_or_else(|| AppError::auth_invalid("vector store token not recognized"))?;

        if !requesting_user.is_empty() {
            if let Some(token_user) = entry.user_name.as_deref() {
                if !token_user.is_empty() && token_user != requesting_user {
                    return Err(AppError::forbidden(
                        "Token user does not match request user",
                    ));
                }
            }
        }

        Ok(entry.refs.clone())
    }
}

/// Resolver used when no token secret is configured. Raw vector store ids
/// still work; opaque tokens are rejected.
pub struct UnconfiguredResolver;

#[async_trait]
impl VectorStoreTokenResolver for UnconfiguredResolver {
    async fn resolve(&self, _token: &str, _requesting_user: &str) -> AppResult<GroundingRefs> {
        Err(AppError::config(
            "no vector store token resolver is configured",
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::errors::ErrorCode;

    fn refs() -> GroundingRefs {
        GroundingRefs {
            vector_store_id: "vs_123".into(),
            assistant_id: Some("asst_9".into()),
        }
    }

    #[tokio::test]
    async fn test_known_token_resolves() {
        let resolver = StaticTokenResolver::new().with_entry("tok-a", refs(), None);
        let resolved = resolver.resolve("tok-a", "sam@example.gov").await.unwrap();
        assert_eq!(resolved, refs());
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let resolver = StaticTokenResolver::new();
        let err = resolver.resolve("tok-a", "").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthInvalid);
    }

    #[tokio::test]
    async fn test_user_mismatch_is_forbidden() {
        let resolver = StaticTokenResolver::new().with_entry(
            "tok-a",
            refs(),
            Some("owner@example.gov".into()),
        );
        let err = resolver
            .resolve("tok-a", "intruder@example.gov")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_matching_user_is_allowed() {
        let resolver = StaticTokenResolver::new().with_entry(
            "tok-a",
            refs(),
            Some("owner@example.gov".into()),
        );
        assert!(resolver.resolve("tok-a", "owner@example.gov").await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_requesting_user_skips_check() {
        let resolver = StaticTokenResolver::new().with_entry(
            "tok-a",
            refs(),
            Some("owner@example.gov".into()),
        );
        assert!(resolver.resolve("tok-a", "").await.is_ok());
    }

    #[tokio::test]
    async fn test_unconfigured_resolver_rejects_tokens() {
        let err = UnconfiguredResolver
            .resolve("tok-a", "sam@example.gov")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigError);
    }
}
