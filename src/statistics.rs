use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Error;

/// Content types whose bodies are split on newlines to count messages.
/// Some shippers send newline-delimited JSON as `application/json`.
const MESSAGE_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/ndjson",
    "application/x-ndjson",
    "text/plain",
];

/// Timing and outcome of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// `0` when the connection was dropped before a response was produced.
    pub status: u16,
}

/// Aggregate counters plus the full request log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub byte_total: u64,
    pub first_message: String,
    pub last_message: String,
    pub message_count: u64,
    pub request_count: u64,
    pub requests: Vec<RequestRecord>,
}

/// Everything captured about a request before it is folded into the totals.
#[derive(Debug, Clone)]
pub struct HandledRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub status: u16,
}

/// Shared statistics. All mutation goes through [`record`](Self::record);
/// readers only ever get copies.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    statistics: Mutex<Statistics>,
    pending: AtomicUsize,
    settled: Notify,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, request: HandledRequest) {
        let messages = split_messages(request.content_type.as_deref(), &request.body);
        let message_count = messages.len() as u64;
        let first = messages.first().copied().unwrap_or_default();
        let last = messages.last().copied().unwrap_or_default();

        let mut stats = self.statistics.lock();
        stats.request_count += 1;
        stats.byte_total += request.body.len() as u64;
        stats.message_count += message_count;
        if stats.first_message.is_empty() && !first.is_empty() {
            stats.first_message = String::from_utf8_lossy(first).into_owned();
        }
        if !last.is_empty() {
            stats.last_message = String::from_utf8_lossy(last).into_owned();
        }
        stats.requests.push(RequestRecord {
            start: request.start,
            end: request.end,
            status: request.status,
        });
    }

    /// Records on a separate task so the caller's response is not held up.
    pub fn record_in_background(self: &Arc<Self>, request: HandledRequest) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let collector = self.clone();
        let job = move || {
            collector.record(request);
            if collector.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                collector.settled.notify_waiters();
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { job() });
            }
            Err(_) => job(),
        }
    }

    /// Waits until every background recording started so far has landed.
    pub async fn settle(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> Statistics {
        self.statistics.lock().clone()
    }

    /// `(message_count, request_count)` read under one lock.
    pub fn counts(&self) -> (u64, u64) {
        let stats = self.statistics.lock();
        (stats.message_count, stats.request_count)
    }

    pub fn message_count(&self) -> u64 {
        self.statistics.lock().message_count
    }

    pub fn request_count(&self) -> u64 {
        self.statistics.lock().request_count
    }
}

/// Splits on raw `\n` bytes; bodies need not be valid UTF-8.
fn split_messages<'a>(content_type: Option<&str>, body: &'a [u8]) -> Vec<&'a [u8]> {
    let Some(content_type) = content_type else {
        return Vec::new();
    };
    let media_type = content_type.split(';').next().unwrap_or("").trim();
    if !MESSAGE_CONTENT_TYPES.iter().any(|t| t.eq_ignore_ascii_case(media_type)) {
        return Vec::new();
    }
    body.split(|&b| b == b'\n').collect()
}

/// A request whose record is written when this is dropped: either after
/// [`finish`](Self::finish) or, if the request future is cancelled because its
/// connection was dropped, with status `0`.
struct PendingRecord {
    collector: Arc<StatisticsCollector>,
    request: Option<HandledRequest>,
}

impl PendingRecord {
    fn finish(&mut self, status: StatusCode) {
        if let Some(request) = self.request.as_mut() {
            request.status = status.as_u16();
        }
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if let Some(mut request) = self.request.take() {
            request.end = Utc::now();
            self.collector.record_in_background(request);
        }
    }
}

/// Statistics capture middleware. Buffers the body so it can be counted and
/// observes the status the rest of the chain responds with.
pub async fn capture(State(collector): State<Arc<StatisticsCollector>>, request: Request, next: Next) -> Response {
    let start = Utc::now();
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => return Error::BodyRead(err.to_string()).into_response(),
    };

    let mut pending = PendingRecord {
        collector,
        request: Some(HandledRequest {
            start,
            end: start,
            content_type,
            body: body.clone(),
            status: 0,
        }),
    };

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    pending.finish(response.status());
    response
}

/// Logs the running totals every `period` until `shutdown` flips.
pub fn spawn_reporter(
    collector: Arc<StatisticsCollector>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (messages, requests) = collector.counts();
                    info!(messages, requests, "Received {} messages across {} requests", messages, requests);
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
