// ABOUTME: Drives one upstream exchange onto the HTTP response byte stream
// ABOUTME: Citation hold window, terminal error capture, audit finalization
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! # Stream Relay
//!
//! The relay consumes the normalized upstream events of one exchange and
//! turns them into response bytes. Every text delta passes through the
//! citation rewriter on its way out. When a delta ends inside an
//! unfinished citation sentinel, the relay holds output briefly so the
//! marker can complete and be rewritten as one piece; the hold is bounded
//! by a chunk countdown and a hard timeout, after which the text flushes
//! as-is. Deltas are never reordered and, outside a hold, never coalesced.
//!
//! A terminal upstream error stops further text from being forwarded but
//! not the bookkeeping: the audit logger always runs exactly once with the
//! full emitted transcript (error-suffixed when one was captured) before
//! the error is signaled to the HTTP layer.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::citations::{self, FileIdNameMap};
use crate::config::RelayTuning;
use crate::errors::AppError;
use crate::llm::{InvokedUpstream, StreamEvent};

/// Relays invoked exchanges to response byte streams
#[derive(Clone)]
pub struct StreamRelay {
    tuning: RelayTuning,
    audit: AuditLogger,
}

/// Citation hold window over raw, not-yet-emitted text
struct HoldWindow {
    text: String,
    citations: Vec<citations::Citation>,
    chunks_left: u32,
    deadline: Instant,
}

impl StreamRelay {
    /// Create a relay
    #[must_use]
    pub fn new(tuning: RelayTuning, audit: AuditLogger) -> Self {
        Self { tuning, audit }
    }

    /// Turn one invoked exchange into the response byte stream.
    ///
    /// The stream yields rewritten text chunks in arrival order. On a
    /// captured upstream failure it finishes with a single error item
    /// after audit finalization; on success it simply ends.
    pub fn stream_exchange(
        &self,
        invoked: InvokedUpstream,
        user_name: Option<String>,
    ) -> impl Stream<Item = Result<Bytes, AppError>> + Send + 'static {
        let tuning = self.tuning.clone();
        let audit = self.audit.clone();

        async_stream::stream! {
            let InvokedUpstream {
                events,
                file_map,
                messages,
                temperature,
                model_name,
            } = invoked;
            let file_map = file_map.filter(|m| !m.is_empty());
            let mut events = events;

            let mut transcript = String::new();
            let mut failure: Option<(String, AppError)> = None;
            let mut hold: Option<HoldWindow> = None;

            loop {
                // While holding, the flush deadline must fire even if the
                // upstream goes quiet.
                let item = if let Some(deadline) = hold.as_ref().map(|w| w.deadline) {
                    match tokio::time::timeout_at(deadline, events.next()).await {
                        Ok(item) => item,
                        Err(_) => {
                            if let Some(window) = hold.take() {
                                warn!("citation hold timed out, flushing as-is");
                                let flushed = rewrite_window(&window, file_map.as_ref());
                                if !flushed.is_empty() {
                                    transcript.push_str(&flushed);
                                    yield Ok(Bytes::from(flushed));
                                }
                            }
                            continue;
                        }
                    }
                } else {
                    events.next().await
                };

                let Some(item) = item else {
                    break;
                };

                match item {
                    Ok(StreamEvent::Text { delta, citations }) => {
                        if failure.is_some() || delta.is_empty() {
                            continue;
                        }

                        if let Some(window) = &mut hold {
                            window.text.push_str(&delta);
                            window.citations.extend(citations);
                            window.chunks_left = window.chunks_left.saturating_sub(1);

                            let candidate = rewrite_window(window, file_map.as_ref());
                            let resolved = !citations::contains_sentinel(&candidate);
                            if resolved
                                || window.chunks_left == 0
                                || Instant::now() >= window.deadline
                            {
                                hold = None;
                                transcript.push_str(&candidate);
                                yield Ok(Bytes::from(candidate));
                            }
                            continue;
                        }

                        let rewritten =
                            citations::rewrite(&delta, &citations, file_map.as_ref());
                        if citations::contains_sentinel(&rewritten) {
                            // An unfinished marker: buffer the raw delta and
                            // wait for the rest of it.
                            debug!("entering citation hold window");
                            hold = Some(HoldWindow {
                                text: delta,
                                citations,
                                chunks_left: tuning.citation_hold_chunks,
                                deadline: Instant::now() + tuning.citation_hold_timeout,
                            });
                            continue;
                        }

                        transcript.push_str(&rewritten);
                        yield Ok(Bytes::from(rewritten));
                    }
                    Ok(StreamEvent::Error { message }) => {
                        if failure.is_none() {
                            warn!(reason = %message, "upstream reported a failed generation");
                            failure =
                                Some((message.clone(), AppError::incomplete(message)));
                        }
                    }
                    Ok(StreamEvent::End) => break,
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some((e.message.clone(), e));
                        }
                        break;
                    }
                }
            }

            // Residual held text flushes before finalization.
            if let Some(window) = hold.take() {
                let flushed = rewrite_window(&window, file_map.as_ref());
                if !flushed.is_empty() {
                    transcript.push_str(&flushed);
                    yield Ok(Bytes::from(flushed));
                }
            }

            let logged = match &failure {
                None => transcript,
                Some((message, _)) => format!("{transcript}\n\nError: {message}"),
            };
            audit.log_exchange(
                user_name.as_deref(),
                &model_name,
                temperature,
                &messages,
                &logged,
            );

            if let Some((_, error)) = failure {
                yield Err(error);
            }
        }
    }
}

fn rewrite_window(window: &HoldWindow, file_map: Option<&FileIdNameMap>) -> String {
    citations::rewrite(&window.text, &window.citations, file_map)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::audit::{AuditSink, MemoryAuditSink};
    use crate::citations::Citation;
    use crate::llm::{EventStream, PreparedMessage};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_tuning() -> RelayTuning {
        RelayTuning {
            citation_hold_chunks: 50,
            citation_hold_timeout: Duration::from_secs(5),
            run_poll_interval: Duration::from_millis(10),
            run_poll_max_attempts: None,
        }
    }

    fn relay_with_sink(tuning: RelayTuning) -> (StreamRelay, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditLogger::new(Arc::clone(&sink) as Arc<dyn AuditSink>);
        (StreamRelay::new(tuning, audit), sink)
    }

    fn events_from(items: Vec<Result<StreamEvent, AppError>>) -> EventStream {
        Box::pin(futures_util::stream::iter(items))
    }

    fn invoked(events: EventStream, file_map: Option<FileIdNameMap>) -> InvokedUpstream {
        InvokedUpstream {
            events,
            file_map,
            messages: vec![
                PreparedMessage::new("system", "Respond using markdown."),
                PreparedMessage::new("user", "hello"),
            ],
            temperature: Some(0.5),
            model_name: "GPT-4".to_owned(),
        }
    }

    async fn collect(
        stream: impl Stream<Item = Result<Bytes, AppError>> + Send,
    ) -> (Vec<String>, Option<AppError>) {
        tokio::pin!(stream);
        let mut chunks = Vec::new();
        let mut error = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => chunks.push(String::from_utf8(bytes.to_vec()).unwrap()),
                Err(e) => error = Some(e),
            }
        }
        (chunks, error)
    }

    #[tokio::test]
    async fn test_deltas_pass_through_in_order() {
        let (relay, sink) = relay_with_sink(test_tuning());
        let events = events_from(vec![
            Ok(StreamEvent::text("Hi")),
            Ok(StreamEvent::text(" there")),
            Ok(StreamEvent::End),
        ]);

        let (chunks, error) = collect(
            relay.stream_exchange(invoked(events, None), Some("alice".to_owned())),
        )
        .await;

        assert_eq!(chunks, vec!["Hi".to_owned(), " there".to_owned()]);
        assert!(error.is_none());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model, "GPT-4");
        assert_eq!(records[0].temperature, Some(0.5));
        assert_eq!(records[0].user_name.as_deref(), Some("alice"));
        assert!(records[0].messages_json.contains("Hi there"));
    }

    #[tokio::test]
    async fn test_empty_deltas_are_dropped_entirely() {
        let (relay, sink) = relay_with_sink(test_tuning());
        let events = events_from(vec![
            Ok(StreamEvent::text("")),
            Ok(StreamEvent::text("a")),
            Ok(StreamEvent::text("")),
            Ok(StreamEvent::End),
        ]);

        let (chunks, _) = collect(relay.stream_exchange(invoked(events, None), None)).await;
        assert_eq!(chunks, vec!["a".to_owned()]);
        assert!(sink.records()[0].messages_json.contains("\"content\":\"a\""));
    }

    #[tokio::test]
    async fn test_error_finalizes_audit_then_signals() {
        let (relay, sink) = relay_with_sink(test_tuning());
        let events = events_from(vec![
            Ok(StreamEvent::text("partial")),
            Ok(StreamEvent::Error {
                message: "rate_limited".to_owned(),
            }),
            Ok(StreamEvent::text("ignored tail")),
            Ok(StreamEvent::End),
        ]);

        let (chunks, error) =
            collect(relay.stream_exchange(invoked(events, None), None)).await;

        assert_eq!(chunks, vec!["partial".to_owned()]);
        let error = error.unwrap();
        assert_eq!(error.message, "rate_limited");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0]
            .messages_json
            .contains("partial\\n\\nError: rate_limited"));
    }

    #[tokio::test]
    async fn test_transport_failure_still_audits() {
        let (relay, sink) = relay_with_sink(test_tuning());
        let events = events_from(vec![
            Ok(StreamEvent::text("hello")),
            Err(AppError::transport("connection reset")),
        ]);

        let (chunks, error) =
            collect(relay.stream_exchange(invoked(events, None), None)).await;

        assert_eq!(chunks, vec!["hello".to_owned()]);
        assert!(error.unwrap().message.contains("connection reset"));
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_split_sentinel_is_held_and_rewritten_whole() {
        let (relay, _sink) = relay_with_sink(test_tuning());
        let map: FileIdNameMap = [
            ("file-a".to_owned(), "a.pdf".to_owned()),
            ("file-b".to_owned(), "b.pdf".to_owned()),
            ("file-c".to_owned(), "report.pdf".to_owned()),
        ]
        .into_iter()
        .collect();

        let events = events_from(vec![
            Ok(StreamEvent::text("see \u{e200}turn0fi")),
            Ok(StreamEvent::text("le2\u{e201} end")),
            Ok(StreamEvent::End),
        ]);

        let (chunks, error) =
            collect(relay.stream_exchange(invoked(events, Some(map)), None)).await;

        assert!(error.is_none());
        assert_eq!(chunks, vec!["see 【5:2†report.pdf】 end".to_owned()]);
    }

    #[tokio::test]
    async fn test_chunk_countdown_flushes_unresolved_hold() {
        let mut tuning = test_tuning();
        tuning.citation_hold_chunks = 2;
        let (relay, _sink) = relay_with_sink(tuning);

        let events = events_from(vec![
            Ok(StreamEvent::text("x\u{e200}turn0fi")),
            Ok(StreamEvent::text("a")),
            Ok(StreamEvent::text("b")),
            Ok(StreamEvent::text("c")),
            Ok(StreamEvent::End),
        ]);

        let (chunks, _) = collect(relay.stream_exchange(invoked(events, None), None)).await;

        // Nothing is lost and order is preserved even though the marker
        // never completed.
        assert_eq!(chunks.concat(), "x\u{e200}turn0fiabc");
        assert_eq!(chunks[0], "x\u{e200}turn0fiab");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_timeout_flushes_without_further_events() {
        let (relay, _sink) = relay_with_sink(test_tuning());
        let held: Vec<Result<StreamEvent, AppError>> =
            vec![Ok(StreamEvent::text("tail\u{e200}turn0fi"))];
        let events: EventStream = Box::pin(
            futures_util::stream::iter(held).chain(futures_util::stream::pending()),
        );

        let stream = relay.stream_exchange(invoked(events, None), None);
        tokio::pin!(stream);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from("tail\u{e200}turn0fi"));
    }

    #[tokio::test]
    async fn test_residual_hold_flushes_at_stream_end() {
        let (relay, sink) = relay_with_sink(test_tuning());
        let events = events_from(vec![
            Ok(StreamEvent::text("dangling\u{e200}turn0fi")),
            Ok(StreamEvent::End),
        ]);

        let (chunks, _) = collect(relay.stream_exchange(invoked(events, None), None)).await;

        assert_eq!(chunks, vec!["dangling\u{e200}turn0fi".to_owned()]);
        assert!(sink.records()[0].messages_json.contains("dangling"));
    }

    #[tokio::test]
    async fn test_bounded_citations_are_applied_per_delta() {
        let (relay, _sink) = relay_with_sink(test_tuning());
        let citation = Citation::UrlCitation {
            url: Some("https://example.org".to_owned()),
            title: None,
            start_index: 4,
            end_index: 10,
        };
        let events = events_from(vec![
            Ok(StreamEvent::Text {
                delta: "pre marker post".to_owned(),
                citations: vec![citation],
            }),
            Ok(StreamEvent::End),
        ]);

        let (chunks, _) = collect(relay.stream_exchange(invoked(events, None), None)).await;
        assert_eq!(chunks, vec!["pre\n\n* marker".to_owned()]);
    }
}
