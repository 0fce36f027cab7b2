// ABOUTME: Structured audit logging of finished chat exchanges
// ABOUTME: Serializes the transcript and emits it as size-bounded paged records
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Audit Logger
//!
//! Every finished exchange, successful or not, produces one audit entry:
//! the messages sent upstream plus the final assistant text, serialized to
//! JSON and split into fixed-size pages so each emitted line stays under
//! downstream log-ingestion limits. Pages share a fresh `logID` so they can
//! be reassembled; concatenating the `messagesJSON` slices in page order
//! reconstructs the transcript exactly.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::constants::limits;
use crate::llm::PreparedMessage;

/// Timestamp format stamped on the final assistant entry, local time with
/// a numeric offset
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// One page of an audit entry. Field names follow the downstream ingestion
/// schema; `userName` and `temperature` serialize as explicit nulls when
/// absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingRecord {
    /// One slice of the serialized transcript
    #[serde(rename = "messagesJSON")]
    pub messages_json: String,
    /// Requesting principal name, when the request carried one
    #[serde(rename = "userName")]
    pub user_name: Option<String>,
    /// Correlation id shared by all pages of one exchange
    #[serde(rename = "logID")]
    pub log_id: String,
    /// Temperature sent upstream, absent for models that reject one
    pub temperature: Option<f32>,
    /// Display name of the invoked model
    pub model: String,
    /// 1-based page index
    pub page: usize,
    /// Total pages for this exchange
    #[serde(rename = "totalPages")]
    pub total_pages: usize,
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    /// Accept one record. Implementations must not fail the exchange.
    fn record(&self, record: &LoggingRecord);
}

/// Emits each record as one JSON line on the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &LoggingRecord) {
        match serde_json::to_string(record) {
            Ok(line) => info!(target: "audit", "{line}"),
            Err(e) => error!("failed to serialize audit record: {e}"),
        }
    }
}

/// Collects records in memory so tests can assert on them
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<LoggingRecord>>,
}

impl MemoryAuditSink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    #[must_use]
    pub fn records(&self) -> Vec<LoggingRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &LoggingRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Builds and emits the paged records for finished exchanges
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    /// Create a logger writing to the given sink
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Record one finished exchange.
    ///
    /// The transcript is the prepared messages followed by an assistant
    /// entry holding the final text and a local completion timestamp. Page
    /// boundaries depend only on the transcript, so re-logging the same
    /// exchange produces identical slices. Failures here are logged and
    /// swallowed; audit problems never override the exchange outcome.
    pub fn log_exchange(
        &self,
        user_name: Option<&str>,
        model: &str,
        temperature: Option<f32>,
        messages: &[PreparedMessage],
        final_text: &str,
    ) {
        let mut entries: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        entries.push(json!({
            "role": "assistant",
            "content": final_text,
            "timestamp": Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }));

        let messages_json = match serde_json::to_string(&entries) {
            Ok(value) => value,
            Err(e) => {
                error!("failed to serialize audit transcript: {e}");
                return;
            }
        };

        let chars: Vec<char> = messages_json.chars().collect();
        let page_size = limits::AUDIT_PAGE_CHARS;
        let total_pages = chars.len().div_ceil(page_size);
        let log_id = Uuid::new_v4().to_string();

        for page in 0..total_pages {
            let start = page * page_size;
            let end = (start + page_size).min(chars.len());
            let record = LoggingRecord {
                messages_json: chars[start..end].iter().collect(),
                user_name: user_name.map(ToOwned::to_owned),
                log_id: log_id.clone(),
                temperature,
                model: model.to_owned(),
                page: page + 1,
                total_pages,
            };
            self.sink.record(&record);
        }
    }
}
