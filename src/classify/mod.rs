//! Usage/text extraction and embedded-error detection for backend responses.
//!
//! Each request family has its own classifier. All of them are tolerant: a body or
//! event that fails to decode is logged and skipped, never surfaced as an error.

mod chat;
mod responses;

use axum::http::StatusCode;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::request::RequestKind;
use crate::utils::sse::{SseEvent, SseFramer};

pub use chat::ChatClassifier;
pub use responses::ResponsesClassifier;
pub(crate) use responses::conversation_id;

/// Token counters normalised across the chat (`prompt_tokens`/`completion_tokens`) and
/// responses (`input_tokens`/`output_tokens`) wire shapes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let prompt_tokens = obj
            .get("prompt_tokens")
            .or_else(|| obj.get("input_tokens"))
            .and_then(Value::as_u64);
        let completion_tokens = obj
            .get("completion_tokens")
            .or_else(|| obj.get("output_tokens"))
            .and_then(Value::as_u64);
        let reasoning_tokens = obj
            .get("output_tokens_details")
            .or_else(|| obj.get("completion_tokens_details"))
            .and_then(|details| details.get("reasoning_tokens"))
            .and_then(Value::as_u64);
        let total_tokens = obj.get("total_tokens").and_then(Value::as_u64).or_else(|| {
            prompt_tokens.and_then(|prompt| {
                completion_tokens.map(|completion| prompt.saturating_add(completion))
            })
        });

        let usage = Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            reasoning_tokens,
        };
        (usage != Self::default()).then_some(usage)
    }
}

/// An error reported by the backend inside a nominally successful response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbeddedError {
    pub status: StatusCode,
    pub code: Option<String>,
    pub body: Bytes,
}

impl EmbeddedError {
    pub fn is_retryable(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
            || self.status.is_server_error()
            || self.code.as_deref().is_some_and(is_state_mismatch_code)
    }
}

/// Error codes meaning "this backend does not hold the state the request refers to".
pub(crate) fn is_state_mismatch_code(code: &str) -> bool {
    matches!(code, "invalid_encrypted_content" | "previous_response_not_found")
}

/// Builds an [`EmbeddedError`] from an error object (`{"code","message","status","type"}`).
/// `raw` is the event payload surfaced as the retry body.
pub(crate) fn embedded_error(error: &Value, raw: &str) -> EmbeddedError {
    let code = error
        .get("code")
        .and_then(|code| match code {
            Value::String(code) => Some(code.clone()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        })
        .or_else(|| error.get("type").and_then(Value::as_str).map(str::to_string));

    let explicit_status = error
        .get("status")
        .and_then(|status| match status {
            Value::Number(status) => status.as_u64(),
            Value::String(status) => status.trim().parse::<u64>().ok(),
            _ => None,
        })
        .and_then(|status| u16::try_from(status).ok())
        .and_then(|status| StatusCode::from_u16(status).ok());

    let status = explicit_status.unwrap_or_else(|| {
        code.as_deref()
            .map(status_for_error_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    });

    EmbeddedError {
        status,
        code,
        body: Bytes::copy_from_slice(raw.trim().as_bytes()),
    }
}

fn status_for_error_code(code: &str) -> StatusCode {
    let lower = code.trim().to_ascii_lowercase();
    if let Ok(numeric) = lower.parse::<u16>() {
        if let Ok(status) = StatusCode::from_u16(numeric) {
            return status;
        }
    }
    match lower.as_str() {
        "too_many_requests" | "rate_limit_exceeded" | "rate_limit_error" | "ratelimitreached"
        | "insufficient_quota_temporary" => StatusCode::TOO_MANY_REQUESTS,
        "server_is_overloaded" | "overloaded" | "overloaded_error" | "service_unavailable"
        | "slow_down" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" | "request_timeout" | "gateway_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "invalid_request_error" | "invalid_prompt" | "context_length_exceeded"
        | "content_filter" | "invalid_api_key" | "invalid_encrypted_content"
        | "previous_response_not_found" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// What a classifier learned from one event.
#[derive(Debug, Default)]
pub struct EventOutcome {
    pub content: bool,
    pub error: Option<EmbeddedError>,
}

/// What one body chunk contributed to the accumulator.
#[derive(Debug, Default)]
pub struct ChunkSummary {
    pub events: usize,
    pub content_seen: bool,
    pub error: Option<EmbeddedError>,
}

/// Usage/text extracted from a whole (non-streaming) body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BodySummary {
    pub usage: Option<Usage>,
    pub text: Option<String>,
    pub response_id: Option<String>,
    pub conversation_id: Option<String>,
}

pub trait ResponseClassifier: Send + Sync {
    fn summarize_body(&self, body: &[u8]) -> BodySummary;

    fn observe_event(&self, event: &SseEvent, acc: &mut StreamAccumulator) -> EventOutcome;
}

/// Only looks for `{"error": ...}` payloads; used for paths the relay does not classify.
#[derive(Debug, Default)]
pub struct PassthroughClassifier;

impl ResponseClassifier for PassthroughClassifier {
    fn summarize_body(&self, body: &[u8]) -> BodySummary {
        let usage = decode_body(body).and_then(|value| value.get("usage").and_then(Usage::from_value));
        BodySummary {
            usage,
            ..BodySummary::default()
        }
    }

    fn observe_event(&self, event: &SseEvent, acc: &mut StreamAccumulator) -> EventOutcome {
        if event.is_done() {
            acc.done = true;
            return EventOutcome::default();
        }
        let Some(payload) = event.json() else {
            return EventOutcome::default();
        };
        EventOutcome {
            content: false,
            error: payload
                .get("error")
                .filter(|error| !error.is_null())
                .map(|error| embedded_error(error, &event.data)),
        }
    }
}

static CHAT: ChatClassifier = ChatClassifier;
static RESPONSES: ResponsesClassifier = ResponsesClassifier;
static PASSTHROUGH: PassthroughClassifier = PassthroughClassifier;

pub fn classifier_for(kind: RequestKind) -> &'static dyn ResponseClassifier {
    match kind {
        RequestKind::Chat | RequestKind::Embeddings => &CHAT,
        RequestKind::StatefulResponse => &RESPONSES,
        RequestKind::Unclassified => &PASSTHROUGH,
    }
}

pub(crate) fn decode_body(body: &[u8]) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, body_len = body.len(), "failed to decode backend body as json");
            None
        }
    }
}

/// Per-attempt streaming state: re-framed events, text pieces, latest usage, flags.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    framer: SseFramer,
    pieces: Vec<String>,
    final_text: Option<String>,
    pub(crate) usage: Option<Usage>,
    pub(crate) first_content_seen: bool,
    pub(crate) done: bool,
    pub(crate) response_id: Option<String>,
    pub(crate) conversation_id: Option<String>,
    pub(crate) last_error: Option<EmbeddedError>,
}

impl StreamAccumulator {
    pub fn ingest(&mut self, classifier: &dyn ResponseClassifier, chunk: &[u8]) -> ChunkSummary {
        let events = self.framer.push(chunk);
        self.observe_all(classifier, events)
    }

    /// Flushes an unterminated trailing event once the body has ended.
    pub fn finish(&mut self, classifier: &dyn ResponseClassifier) -> ChunkSummary {
        let events = self.framer.finish();
        self.observe_all(classifier, events)
    }

    fn observe_all(
        &mut self,
        classifier: &dyn ResponseClassifier,
        events: Vec<SseEvent>,
    ) -> ChunkSummary {
        let mut summary = ChunkSummary {
            events: events.len(),
            ..ChunkSummary::default()
        };
        for event in &events {
            let outcome = classifier.observe_event(event, self);
            if outcome.content {
                summary.content_seen = true;
                self.first_content_seen = true;
            }
            if let Some(error) = outcome.error {
                self.last_error = Some(error.clone());
                if summary.error.is_none() {
                    summary.error = Some(error);
                }
            }
        }
        summary
    }

    pub(crate) fn push_text(&mut self, piece: &str) {
        if !piece.is_empty() {
            self.pieces.push(piece.to_string());
        }
    }

    pub(crate) fn set_final_text(&mut self, text: String) {
        self.final_text = Some(text);
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Authoritative final text when the stream carried one, else the concatenated deltas.
    pub fn text(&self) -> Option<String> {
        if let Some(text) = self.final_text.as_ref() {
            return Some(text.clone());
        }
        (!self.pieces.is_empty()).then(|| self.pieces.concat())
    }
}
