use serde_json::Value;

use super::{
    BodySummary, EventOutcome, ResponseClassifier, StreamAccumulator, Usage, decode_body,
    embedded_error,
};
use crate::utils::sse::SseEvent;

/// Stateful `/responses` objects and their typed event stream.
#[derive(Debug, Default)]
pub struct ResponsesClassifier;

impl ResponseClassifier for ResponsesClassifier {
    fn summarize_body(&self, body: &[u8]) -> BodySummary {
        let Some(value) = decode_body(body) else {
            return BodySummary::default();
        };
        summarize_response_object(&value)
    }

    fn observe_event(&self, event: &SseEvent, acc: &mut StreamAccumulator) -> EventOutcome {
        if event.is_done() {
            acc.done = true;
            return EventOutcome::default();
        }
        let Some(payload) = event.json() else {
            return EventOutcome::default();
        };
        let kind = event.event_type(Some(&payload)).unwrap_or_default();
        let mut outcome = EventOutcome::default();

        match kind.as_str() {
            "response.output_text.delta" => {
                let delta = payload.get("delta").and_then(Value::as_str).unwrap_or_default();
                if !delta.is_empty() {
                    acc.push_text(delta);
                    outcome.content = true;
                }
            }
            "response.output_item.added" => {
                if let Some(item) = payload.get("item") {
                    let text = item_text(item);
                    if !text.is_empty() {
                        acc.push_text(&text);
                        outcome.content = true;
                    }
                    if item.get("type").and_then(Value::as_str) == Some("function_call") {
                        outcome.content = true;
                    }
                }
            }
            "response.created" | "response.in_progress" => {
                if let Some(response) = payload.get("response") {
                    remember_ids(acc, response);
                }
            }
            "response.completed" => {
                if let Some(response) = payload.get("response") {
                    let summary = summarize_response_object(response);
                    if let Some(text) = summary.text {
                        acc.set_final_text(text);
                    }
                    if summary.usage.is_some() {
                        acc.usage = summary.usage;
                    }
                    remember_ids(acc, response);
                }
                acc.done = true;
            }
            "response.incomplete" => {
                let response = payload.get("response");
                let reason = response
                    .and_then(|response| response.get("incomplete_details"))
                    .and_then(|details| details.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::warn!(reason, "backend response ended incomplete");
                if let Some(usage) = response
                    .and_then(|response| response.get("usage"))
                    .and_then(Usage::from_value)
                {
                    acc.usage = Some(usage);
                }
                acc.done = true;
            }
            "response.failed" => {
                let error = payload
                    .get("response")
                    .and_then(|response| response.get("error"))
                    .filter(|error| !error.is_null())
                    .cloned()
                    .unwrap_or(Value::Null);
                outcome.error = Some(embedded_error(&error, &event.data));
            }
            "error" => {
                let error = payload
                    .get("error")
                    .filter(|error| error.is_object())
                    .unwrap_or(&payload);
                outcome.error = Some(embedded_error(error, &event.data));
            }
            _ => {
                if let Some(error) = payload.get("error").filter(|error| error.is_object()) {
                    outcome.error = Some(embedded_error(error, &event.data));
                }
            }
        }
        outcome
    }
}

fn remember_ids(acc: &mut StreamAccumulator, response: &Value) {
    if let Some(id) = response.get("id").and_then(Value::as_str) {
        acc.response_id = Some(id.to_string());
    }
    if let Some(conversation) = conversation_id(response) {
        acc.conversation_id = Some(conversation);
    }
}

fn summarize_response_object(value: &Value) -> BodySummary {
    let text = value
        .get("output_text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .or_else(|| {
            let joined = value
                .get("output")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(item_text)
                .collect::<String>();
            (!joined.is_empty()).then_some(joined)
        });

    BodySummary {
        usage: value.get("usage").and_then(Usage::from_value),
        text,
        response_id: value.get("id").and_then(Value::as_str).map(str::to_string),
        conversation_id: conversation_id(value),
    }
}

fn item_text(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

/// `conversation` is either a bare id or an object carrying one.
pub(crate) fn conversation_id(value: &Value) -> Option<String> {
    match value.get("conversation")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Object(obj) => obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn summarizes_response_object() {
        let body = br#"{
            "id": "resp_1",
            "conversation": {"id": "conv_9"},
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [{"type": "output_text", "text": "Hello"}, {"type": "output_text", "text": " world"}]}
            ],
            "usage": {"input_tokens": 7, "output_tokens": 3, "output_tokens_details": {"reasoning_tokens": 1}}
        }"#;
        let summary = ResponsesClassifier.summarize_body(body);
        assert_eq!(summary.text.as_deref(), Some("Hello world"));
        assert_eq!(summary.response_id.as_deref(), Some("resp_1"));
        assert_eq!(summary.conversation_id.as_deref(), Some("conv_9"));
        let usage = summary.usage.expect("usage");
        assert_eq!(usage.total_tokens, Some(10));
        assert_eq!(usage.reasoning_tokens, Some(1));
    }

    #[test]
    fn output_text_shortcut_wins() {
        let body = br#"{"output_text":"direct","output":[{"content":[{"text":"ignored"}]}]}"#;
        assert_eq!(
            ResponsesClassifier.summarize_body(body).text.as_deref(),
            Some("direct")
        );
    }

    #[test]
    fn stream_tracks_ids_deltas_and_completion() {
        let mut acc = StreamAccumulator::default();
        let created = acc.ingest(
            &ResponsesClassifier,
            b"event: response.created\ndata: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_7\"}}\n\n",
        );
        assert!(!created.content_seen);
        assert_eq!(acc.response_id(), Some("resp_7"));

        let delta = acc.ingest(
            &ResponsesClassifier,
            b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n",
        );
        assert!(delta.content_seen);
        assert_eq!(acc.text().as_deref(), Some("Hi"));

        acc.ingest(
            &ResponsesClassifier,
            b"event: response.completed\ndata: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_7\",\"output_text\":\"Hi there\",\"usage\":{\"input_tokens\":4,\"output_tokens\":2,\"total_tokens\":6}}}\n\n",
        );
        assert!(acc.is_done());
        assert_eq!(acc.text().as_deref(), Some("Hi there"));
        assert_eq!(acc.usage().and_then(|usage| usage.total_tokens), Some(6));
    }

    #[test]
    fn output_item_added_with_content_counts_as_content() {
        let mut acc = StreamAccumulator::default();
        let summary = acc.ingest(
            &ResponsesClassifier,
            b"data: {\"type\":\"response.output_item.added\",\"item\":{\"type\":\"message\",\"content\":[{\"type\":\"output_text\",\"text\":\"x\"}]}}\n\n",
        );
        assert!(summary.content_seen);

        let mut acc = StreamAccumulator::default();
        let summary = acc.ingest(
            &ResponsesClassifier,
            b"data: {\"type\":\"response.output_item.added\",\"item\":{\"type\":\"message\",\"content\":[]}}\n\n",
        );
        assert!(!summary.content_seen);
    }

    #[test]
    fn failed_and_error_events_map_status() {
        let mut acc = StreamAccumulator::default();
        let summary = acc.ingest(
            &ResponsesClassifier,
            b"event: response.failed\ndata: {\"type\":\"response.failed\",\"response\":{\"error\":{\"code\":\"server_is_overloaded\",\"message\":\"busy\"}}}\n\n",
        );
        let error = summary.error.expect("failed");
        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);

        let summary = acc.ingest(
            &ResponsesClassifier,
            b"event: error\ndata: {\"type\":\"error\",\"code\":\"context_length_exceeded\",\"message\":\"too long\"}\n\n",
        );
        let error = summary.error.expect("error");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(!error.is_retryable());
    }

    #[test]
    fn incomplete_is_not_an_error() {
        let mut acc = StreamAccumulator::default();
        let summary = acc.ingest(
            &ResponsesClassifier,
            b"data: {\"type\":\"response.incomplete\",\"response\":{\"incomplete_details\":{\"reason\":\"max_output_tokens\"},\"usage\":{\"input_tokens\":1,\"output_tokens\":9}}}\n\n",
        );
        assert!(summary.error.is_none());
        assert!(acc.is_done());
        assert_eq!(acc.usage().and_then(|usage| usage.total_tokens), Some(10));
    }

    #[test]
    fn conversation_id_accepts_string_or_object() {
        assert_eq!(
            conversation_id(&serde_json::json!({"conversation": "conv_1"})).as_deref(),
            Some("conv_1")
        );
        assert_eq!(
            conversation_id(&serde_json::json!({"conversation": {"id": "conv_2"}})).as_deref(),
            Some("conv_2")
        );
        assert!(conversation_id(&serde_json::json!({"conversation": 5})).is_none());
    }
}
