//! Per-request telemetry shared between the driver and outside log/metrics sinks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use bytes::Bytes;
use serde::Serialize;

use crate::classify::Usage;

/// One dispatch to one backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub backend: String,
    /// HTTP status the backend answered with, if it answered at all.
    pub status: Option<u16>,
    /// Backend-reported error status (HTTP or embedded) before any failover.
    pub error_status: Option<u16>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RequestRecord {
    pub attempts: Vec<AttemptRecord>,
    pub ttft_ms: Option<u64>,
    pub upstream_response_time_ms: Option<u64>,
    pub usage: Option<Usage>,
    pub text: Option<String>,
}

impl RequestRecord {
    /// Backend of the most recent attempt.
    pub fn backend(&self) -> Option<&str> {
        self.attempts.last().map(|attempt| attempt.backend.as_str())
    }

    pub fn last_error_status(&self) -> Option<u16> {
        self.attempts.iter().rev().find_map(|attempt| attempt.error_status)
    }
}

/// Cloning yields another handle to the same record; the relayed body stream keeps one
/// after the driver has returned.
#[derive(Clone, Debug)]
pub struct RequestContext {
    started_at: Instant,
    record: Arc<Mutex<RequestRecord>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            record: Arc::new(Mutex::new(RequestRecord::default())),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> RequestRecord {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, RequestRecord> {
        // A poisoned record is still the best telemetry available.
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin_attempt(&self, backend: &str) {
        self.lock().attempts.push(AttemptRecord {
            backend: backend.to_string(),
            ..AttemptRecord::default()
        });
    }

    pub(crate) fn record_status(&self, status: StatusCode) {
        if let Some(attempt) = self.lock().attempts.last_mut() {
            attempt.status = Some(status.as_u16());
        }
    }

    pub(crate) fn record_error_status(&self, status: StatusCode) {
        if let Some(attempt) = self.lock().attempts.last_mut() {
            attempt.error_status = Some(status.as_u16());
        }
    }

    /// Recorded once; later calls keep the first value.
    pub(crate) fn mark_first_token(&self) {
        self.mark_first_token_at(self.elapsed());
    }

    /// Like [`Self::mark_first_token`] for content read `elapsed` after the start.
    pub(crate) fn mark_first_token_at(&self, elapsed: Duration) {
        let elapsed = duration_ms(elapsed);
        let mut record = self.lock();
        if record.ttft_ms.is_none() {
            record.ttft_ms = Some(elapsed);
        }
    }

    pub(crate) fn mark_upstream_progress(&self) {
        self.mark_upstream_progress_at(self.elapsed());
    }

    pub(crate) fn mark_upstream_progress_at(&self, elapsed: Duration) {
        self.lock().upstream_response_time_ms = Some(duration_ms(elapsed));
    }

    pub(crate) fn record_usage(&self, usage: Option<Usage>, text: Option<String>) {
        let mut record = self.lock();
        if usage.is_some() {
            record.usage = usage;
        }
        if text.is_some() {
            record.text = text;
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sees every relayed body byte exactly once: per chunk when streaming, once for a
/// whole body otherwise.
pub trait BodyObserver: Send + Sync {
    fn on_body_chunk(&self, ctx: &RequestContext, chunk: &Bytes);
}
