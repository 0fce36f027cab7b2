// ABOUTME: Citation annotation types and the two-pass citation rewriter
// ABOUTME: Converts provider sentinel tokens and bounded spans into a stable bracket form
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Citation Rewriting
//!
//! Grounded responses arrive with two citation styles: bounded annotation
//! spans pointing into the text, and private-use-area sentinel tokens of the
//! form `turn<N>file<M>` embedded in the text itself (code points U+E200
//! through U+E210). Both are rewritten into the bracket form
//! `【5:<M>†<filename>】` that the web client knows how to render. Rewriting
//! is pure and total: unresolvable names fall back to what is already in the
//! text, and marker-free text passes through unchanged.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::constants::limits;

/// A citation annotation attached to a streamed content part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Citation {
    /// Span citation referencing a container file
    ContainerFileCitation {
        /// File behind the citation
        #[serde(default)]
        file_id: Option<String>,
        /// Container holding the file
        #[serde(default)]
        container_id: Option<String>,
        /// Resolved filename, when the provider sent one
        #[serde(default)]
        filename: Option<String>,
        /// Start of the cited span, in characters
        start_index: usize,
        /// End of the cited span, exclusive
        end_index: usize,
    },
    /// Span citation referencing a web search result
    UrlCitation {
        /// Source address
        #[serde(default)]
        url: Option<String>,
        /// Page title
        #[serde(default)]
        title: Option<String>,
        /// Start of the cited span, in characters
        start_index: usize,
        /// End of the cited span, exclusive
        end_index: usize,
    },
    /// File-search citation carrying a provider file id
    FileCitation {
        /// File behind the citation
        file_id: String,
        /// Resolved filename, when the provider sent one
        #[serde(default)]
        filename: Option<String>,
        /// Position of the citation marker in the text
        #[serde(default)]
        index: Option<usize>,
    },
    /// Generated-file reference carrying a provider file id
    FilePath {
        /// File behind the citation
        file_id: String,
        /// Position of the citation marker in the text
        #[serde(default)]
        index: Option<usize>,
    },
    /// Annotation kinds this relay does not rewrite
    #[serde(other)]
    Other,
}

impl Citation {
    /// The `[start, end)` span for bounded citation kinds
    #[must_use]
    pub fn bounded_span(&self) -> Option<(usize, usize)> {
        match self {
            Self::ContainerFileCitation {
                start_index,
                end_index,
                ..
            }
            | Self::UrlCitation {
                start_index,
                end_index,
                ..
            } => Some((*start_index, *end_index)),
            _ => None,
        }
    }

    /// The provider file id for file-kind citations
    #[must_use]
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::FileCitation { file_id, .. } | Self::FilePath { file_id, .. } => Some(file_id),
            _ => None,
        }
    }
}

/// Ordered file-id to filename table built from a vector store listing.
/// Sentinel tokens reference files by listing position, annotations by id,
/// so both lookups are needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIdNameMap {
    entries: Vec<(String, String)>,
}

impl FileIdNameMap {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a file entry, preserving first-seen order
    pub fn insert(&mut self, file_id: impl Into<String>, filename: impl Into<String>) {
        let file_id = file_id.into();
        let filename = filename.into();
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == file_id) {
            entry.1 = filename;
        } else {
            self.entries.push((file_id, filename));
        }
    }

    /// Filename for a provider file id
    #[must_use]
    pub fn name_for(&self, file_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(id, _)| id == file_id)
            .map(|(_, name)| name.as_str())
    }

    /// Filename at a listing position
    #[must_use]
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(_, name)| name.as_str())
    }

    /// Number of known files
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for FileIdNameMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (file_id, filename) in iter {
            map.insert(file_id, filename);
        }
        map
    }
}

fn sentinel_regex() -> Option<&'static Regex> {
    static SENTINEL: OnceLock<Option<Regex>> = OnceLock::new();
    SENTINEL
        .get_or_init(|| Regex::new(r"[\x{E200}-\x{E210}]").ok())
        .as_ref()
}

fn file_cite_regex() -> Option<&'static Regex> {
    static FILE_CITE: OnceLock<Option<Regex>> = OnceLock::new();
    FILE_CITE
        .get_or_init(|| {
            Regex::new(
                r"[\x{E200}-\x{E210}]?(?:filecite[\x{E200}-\x{E210}])?turn\d+file(\d+)[\x{E200}-\x{E210}]",
            )
            .ok()
        })
        .as_ref()
}

fn bracket_name_regex() -> Option<&'static Regex> {
    static BRACKET: OnceLock<Option<Regex>> = OnceLock::new();
    BRACKET
        .get_or_init(|| Regex::new(r"【([^】]*?)†([^】]+)】").ok())
        .as_ref()
}

fn display_bracket_regex() -> Option<&'static Regex> {
    static DISPLAY: OnceLock<Option<Regex>> = OnceLock::new();
    DISPLAY
        .get_or_init(|| Regex::new(r"【(.*?)】").ok())
        .as_ref()
}

fn display_payload_regex() -> Option<&'static Regex> {
    static PAYLOAD: OnceLock<Option<Regex>> = OnceLock::new();
    PAYLOAD
        .get_or_init(|| Regex::new(r"(\d+)(?::(\d+))?†(\S+)").ok())
        .as_ref()
}

/// Whether `text` contains any citation sentinel code point
#[must_use]
pub fn contains_sentinel(text: &str) -> bool {
    sentinel_regex().is_some_and(|re| re.is_match(text))
}

/// Rewrite citation markers in `text` into the stable bracket form.
///
/// Bounded citations (container-file and web search spans) are lifted out of
/// the body into a trailing source list; file-search sentinel tokens are
/// normalized to `【5:<M>†<filename>】` against the listing position `<M>` of
/// `file_map`, then any bracket payload whose annotation carries a resolvable
/// file id gets its filename replaced with the real one.
#[must_use]
pub fn rewrite(text: &str, annotations: &[Citation], file_map: Option<&FileIdNameMap>) -> String {
    let text = rewrite_bounded(text, annotations);
    rewrite_file_citations(&text, annotations, file_map)
}

fn rewrite_bounded(text: &str, annotations: &[Citation]) -> String {
    let spans: Vec<(usize, usize)> = annotations
        .iter()
        .filter_map(Citation::bounded_span)
        .collect();
    let Some(&(first_start, _)) = spans.first() else {
        return text.to_owned();
    };

    let chars: Vec<char> = text.chars().collect();
    let cut = first_start.saturating_sub(1).min(chars.len());
    let mut result: String = chars[..cut].iter().collect();
    for (start, end) in spans {
        let start = start.min(chars.len());
        let end = end.min(chars.len());
        result.push_str("\n\n* ");
        if start < end {
            result.extend(&chars[start..end]);
        }
    }
    result
}

fn rewrite_file_citations(
    text: &str,
    annotations: &[Citation],
    file_map: Option<&FileIdNameMap>,
) -> String {
    let (Some(sentinel), Some(file_cite)) = (sentinel_regex(), file_cite_regex()) else {
        return text.to_owned();
    };

    let mut result = text.to_owned();
    // Malformed repeating sentinels must not spin forever
    for _ in 0..limits::CITATION_REWRITE_MAX_PASSES {
        if !sentinel.is_match(&result) {
            break;
        }
        let rewritten = file_cite
            .replace_all(&result, |caps: &Captures<'_>| {
                let index = &caps[1];
                let name = index
                    .parse::<usize>()
                    .ok()
                    .and_then(|position| file_map.and_then(|map| map.name_at(position)))
                    .map_or_else(|| index.to_owned(), ToOwned::to_owned);
                format!("【5:{index}†{name}】")
            })
            .into_owned();
        if rewritten == result {
            break;
        }
        result = rewritten;
    }

    let (Some(map), Some(bracket)) = (file_map, bracket_name_regex()) else {
        return result;
    };
    for annotation in annotations {
        let Some(file_id) = annotation.file_id() else {
            continue;
        };
        let Some(real_name) = map.name_for(file_id) else {
            continue;
        };
        result = bracket
            .replace_all(&result, |caps: &Captures<'_>| {
                let prefix = &caps[1];
                format!("【{prefix}†{real_name}】")
            })
            .into_owned();
    }
    result
}

/// Render bracket citations the way the web client displays them: delimiters
/// stripped and a `N:M†filename` payload reshaped into `filename:M`. Shipped
/// server-side so the emitted syntax and its display form stay locked
/// together.
#[must_use]
pub fn display_form(text: &str) -> String {
    let (Some(bracket), Some(payload)) = (display_bracket_regex(), display_payload_regex()) else {
        return text.to_owned();
    };
    bracket
        .replace_all(text, |caps: &Captures<'_>| {
            payload
                .replace_all(&caps[1], |parts: &Captures<'_>| {
                    let filename = &parts[3];
                    parts.get(2).map_or_else(
                        || filename.to_owned(),
                        |page| format!("{filename}:{}", page.as_str()),
                    )
                })
                .into_owned()
        })
        .into_owned()
}
