// ABOUTME: Server-sent-events line decoding and stream-shape normalization
// ABOUTME: Turns a raw upstream byte stream into normalized StreamEvent items
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! SSE decoding for upstream streams.
//!
//! All three call shapes arrive as `data:`-prefixed SSE lines. The decoder
//! splits bytes into complete lines first and only then converts to UTF-8,
//! so a multi-byte character (citation sentinels included) split across two
//! network chunks is reassembled intact. Each data payload is then probed
//! for which call shape produced it and normalized into a [`StreamEvent`].

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::Stream;

use super::{assistants, completions, responses, EventStream, StreamEvent};
use crate::errors::AppError;

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A data payload line
    Data(String),
    /// The `[DONE]` terminator
    Done,
}

/// Incremental SSE line decoder.
///
/// Feed raw network chunks in any split and collect complete events out.
/// Bytes are buffered until a newline arrives, so lines and multi-byte
/// characters may span chunk boundaries.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }

    /// Drain any unterminated final line after the stream ends
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        parse_line(line.trim_end_matches('\r'))
    }
}

/// Parse one complete line. Empty lines, comments, and non-data fields
/// (`event:`, `id:`, `retry:`) are dropped.
fn parse_line(line: &str) -> Option<SseEvent> {
    let payload = line.strip_prefix("data: ")?;
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    if payload.is_empty() {
        None
    } else {
        Some(SseEvent::Data(payload.to_owned()))
    }
}

/// Probe a data payload for its call shape and normalize it.
///
/// Chat-completion chunks carry `choices`, responses events carry `type`,
/// and assistant run events carry `object`. Payloads matching none of the
/// shapes are skipped; payloads that are not JSON at all surface as a
/// transport error.
pub(crate) fn normalize_payload(payload: &str) -> Option<Result<StreamEvent, AppError>> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(AppError::transport(format!(
                "malformed stream payload: {e}"
            ))));
        }
    };

    if value.get("choices").is_some() {
        return completions::delta_event(&value).map(Ok);
    }
    if value.get("type").is_some() {
        return responses::stream_event(&value).map(Ok);
    }
    if value.get("object").is_some() {
        return assistants::stream_event(&value).map(Ok);
    }
    None
}

/// Decode an upstream SSE byte stream into normalized events.
///
/// The returned stream always terminates with exactly one
/// [`StreamEvent::End`], whether the upstream sent `[DONE]`, closed the
/// connection, or failed mid-read. A read failure yields a transport error
/// before the stream stops.
pub(crate) fn decode_sse_stream<S>(byte_stream: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut lines = SseLineBuffer::new();
        tokio::pin!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
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
                        if let Some(normalized) = normalize_payload(&payload) {
                            yield normalized;
                        }
                    }
                    SseEvent::Done => {
                        yield Ok(StreamEvent::End);
                        return;
                    }
                }
            }
        }

        if let Some(SseEvent::Data(payload)) = lines.flush() {
            if let Some(normalized) = normalize_payload(&payload) {
                yield normalized;
            }
        }
        yield Ok(StreamEvent::End);
    })
}
