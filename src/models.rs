// ABOUTME: Static catalog of deployable chat models with display names and context limits
// ABOUTME: Resolves display names for audit records and maps catalog ids onto deployment ids
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Model Catalog
//!
//! The web client ships a model picker backed by this table; the relay uses it
//! to resolve a display name when the client sends only a model id, and to
//! answer the model-listing endpoint. Two wrinkles live here rather than in
//! the invoker: the `gpt-4` catalog id maps onto the `gpt-4o` deployment, and
//! the reasoning models reject an explicit sampling temperature.

use serde::{Deserialize, Serialize};

/// One deployable model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    /// Catalog id the client sends
    pub id: &'static str,
    /// Human-readable display name
    pub name: &'static str,
    /// Maximum length of one message, in characters
    pub max_length: u32,
    /// Context window for a conversation, in tokens
    pub token_limit: u32,
}

/// Models the relay knows how to serve
pub const KNOWN_MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "gpt-35-turbo",
        name: "GPT-3.5",
        max_length: 12_000,
        token_limit: 4_000,
    },
    ModelSpec {
        id: "gpt-4",
        name: "GPT-4",
        max_length: 128_000 / 4,
        token_limit: 128_000,
    },
    ModelSpec {
        id: "gpt-4o",
        name: "GPT-4o",
        max_length: 128_000 / 4,
        token_limit: 128_000,
    },
    ModelSpec {
        id: "gpt-5",
        name: "GPT-5",
        max_length: 272_000 / 4,
        token_limit: 272_000,
    },
    ModelSpec {
        id: "o1",
        name: "o1",
        max_length: 200_000 / 4,
        token_limit: 200_000,
    },
    ModelSpec {
        id: "o3-mini",
        name: "o3-mini",
        max_length: 200_000 / 4,
        token_limit: 200_000,
    },
];

/// Model ids that reject an explicit sampling temperature. The `gpt5` spelling
/// is the Azure deployment name of the same model.
const TEMPERATURE_REJECTING: &[&str] = &["o3-mini", "o1", "gpt-5", "gpt5"];

/// Look up a catalog entry by id
#[must_use]
pub fn find(id: &str) -> Option<&'static ModelSpec> {
    KNOWN_MODELS.iter().find(|spec| spec.id == id)
}

/// Display name for a model id, falling back to the id itself for ids the
/// catalog does not know (custom deployments)
#[must_use]
pub fn display_name(id: &str) -> String {
    find(id).map_or_else(|| id.to_owned(), |spec| spec.name.to_owned())
}

/// Map a catalog id onto the deployment actually called upstream
#[must_use]
pub fn deployment_id(id: &str) -> &str {
    if id == "gpt-4" {
        "gpt-4o"
    } else {
        id
    }
}

/// Whether this model rejects an explicit temperature
#[must_use]
pub fn rejects_temperature(id: &str) -> bool {
    TEMPERATURE_REJECTING.contains(&id)
}

/// Wire form returned by the model-listing endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelListing {
    /// Catalog id
    pub id: String,
    /// Display name
    pub name: String,
}

impl From<&ModelSpec> for ModelListing {
    fn from(spec: &ModelSpec) -> Self {
        Self {
            id: spec.id.to_owned(),
            name: spec.name.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_known_model() {
        let spec = find("gpt-4").map(|s| s.name);
        assert_eq!(spec, Some("GPT-4"));
        assert!(find("text-embedding-ada").is_none());
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        assert_eq!(display_name("gpt-4"), "GPT-4");
        assert_eq!(display_name("my-custom-deployment"), "my-custom-deployment");
    }

    #[test]
    fn test_deployment_alias() {
        assert_eq!(deployment_id("gpt-4"), "gpt-4o");
        assert_eq!(deployment_id("gpt-4o"), "gpt-4o");
        assert_eq!(deployment_id("gpt-35-turbo"), "gpt-35-turbo");
    }

    #[test]
    fn test_temperature_rejection() {
        assert!(rejects_temperature("o1"));
        assert!(rejects_temperature("gpt-5"));
        assert!(rejects_temperature("gpt5"));
        assert!(!rejects_temperature("gpt-4o"));
    }
}
