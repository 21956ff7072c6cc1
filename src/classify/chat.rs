use serde_json::Value;

use super::{
    BodySummary, EventOutcome, ResponseClassifier, StreamAccumulator, Usage, decode_body,
    embedded_error,
};
use crate::utils::sse::SseEvent;

/// Chat completions and embeddings.
#[derive(Debug, Default)]
pub struct ChatClassifier;

impl ResponseClassifier for ChatClassifier {
    fn summarize_body(&self, body: &[u8]) -> BodySummary {
        let Some(value) = decode_body(body) else {
            return BodySummary::default();
        };

        let texts = value
            .get("choices")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|choice| {
                choice
                    .get("message")
                    .and_then(|message| message.get("content"))
                    .or_else(|| choice.get("text"))
                    .and_then(Value::as_str)
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>();

        BodySummary {
            usage: value.get("usage").and_then(Usage::from_value),
            text: (!texts.is_empty()).then(|| texts.join(" ")),
            response_id: None,
            conversation_id: None,
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

        let mut outcome = EventOutcome::default();
        if let Some(error) = payload.get("error").filter(|error| !error.is_null()) {
            outcome.error = Some(embedded_error(error, &event.data));
            return outcome;
        }

        for choice in payload
            .get("choices")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let delta = choice.get("delta");
            let content = delta
                .and_then(|delta| delta.get("content"))
                .or_else(|| choice.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !content.is_empty() {
                acc.push_text(content);
                outcome.content = true;
            }

            let has_other_content = delta.is_some_and(|delta| {
                delta
                    .get("reasoning_content")
                    .and_then(Value::as_str)
                    .is_some_and(|text| !text.is_empty())
                    || delta
                        .get("tool_calls")
                        .and_then(Value::as_array)
                        .is_some_and(|calls| !calls.is_empty())
            });
            outcome.content |= has_other_content;
        }

        if let Some(usage) = payload.get("usage").and_then(Usage::from_value) {
            acc.usage = Some(usage);
        }
        outcome
    }
}
