use bytes::BytesMut;
use serde_json::Value;

const SSE_FRAMER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const SSE_FRAMER_TAIL_BYTES: usize = 128 * 1024;

/// One decoded server-sent event: the optional `event:` name and the joined `data:` lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn json(&self) -> Option<Value> {
        let trimmed = self.data.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str(trimmed) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode SSE event data as json");
                None
            }
        }
    }

    /// The event type, falling back to the `type` field of a JSON payload when the
    /// stream carries no `event:` line.
    pub fn event_type(&self, payload: Option<&Value>) -> Option<String> {
        if let Some(event) = self.event.as_deref().filter(|event| !event.is_empty()) {
            return Some(event.to_string());
        }
        payload
            .and_then(|value| value.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Decodes one raw chunk into events. Stateless: an event cut off at the end of the
/// chunk is still emitted with whatever lines were present.
pub fn decode_events(chunk: &[u8]) -> Vec<SseEvent> {
    let text = String::from_utf8_lossy(chunk);
    let mut out = Vec::new();
    let mut event: Option<String> = None;
    let mut data = String::new();
    let mut has_data = false;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush_event(&mut out, &mut event, &mut data, &mut has_data);
            continue;
        }
        if line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.trim().to_string()),
            "data" => {
                if has_data {
                    data.push('\n');
                }
                data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }
    flush_event(&mut out, &mut event, &mut data, &mut has_data);
    out
}

fn flush_event(
    out: &mut Vec<SseEvent>,
    event: &mut Option<String>,
    data: &mut String,
    has_data: &mut bool,
) {
    if !*has_data && event.is_none() {
        return;
    }
    out.push(SseEvent {
        event: event.take(),
        data: std::mem::take(data),
    });
    *has_data = false;
}

/// Re-frames a byte stream on SSE event boundaries so that an event split across
/// network chunks is decoded exactly once, after its terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: BytesMut,
}

impl SseFramer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) {
            let frame = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            out.extend(decode_events(frame.as_ref()));
        }

        if self.buffer.len() > SSE_FRAMER_MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(SSE_FRAMER_TAIL_BYTES);
            tracing::warn!(
                dropped_bytes = keep_from,
                "SSE event exceeded framing buffer; discarding head"
            );
            self.buffer = self.buffer.split_off(keep_from);
        }
        out
    }

    /// Decodes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = self.buffer.split();
        decode_events(rest.as_ref())
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 2 {
        return None;
    }

    // Single forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }

    None
}
