use std::time::Duration;

use axum::http::HeaderMap;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

/// Hop-by-hop headers (RFC 9110 §7.6.1) plus `content-length`, which is recomputed on
/// every leg of the relay.
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub(crate) fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

pub(crate) fn content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub(crate) fn is_event_stream(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("text/event-stream")
}

#[derive(Debug, Default)]
pub(crate) struct DrainedBody {
    pub(crate) bytes: Bytes,
    pub(crate) truncated: bool,
    pub(crate) failed: bool,
}

/// Reads a body to its end, keeping at most `max_bytes`. Anything past the limit is read
/// and discarded so the connection can go back to the pool. Read errors and timeouts
/// stop the drain and are logged; they never fail the caller.
pub(crate) async fn drain_body<S, E>(
    mut stream: S,
    max_bytes: usize,
    read_timeout: Duration,
) -> DrainedBody
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let max_bytes = max_bytes.max(1);
    let mut out = BytesMut::new();
    let mut drained = DrainedBody::default();

    loop {
        let next = match tokio::time::timeout(read_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = read_timeout.as_millis() as u64,
                    "timed out draining backend body"
                );
                drained.failed = true;
                break;
            }
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "failed to drain backend body");
                drained.failed = true;
                break;
            }
            None => break,
        };

        let remaining = max_bytes.saturating_sub(out.len());
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            drained.truncated = true;
        }
    }

    drained.bytes = out.freeze();
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn drain_keeps_prefix_and_flags_truncation() {
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let drained = drain_body(chunks, 8, Duration::from_secs(1)).await;
        assert_eq!(drained.bytes, Bytes::from_static(b"hello wo"));
        assert!(drained.truncated);
        assert!(!drained.failed);
    }

    #[tokio::test]
    async fn drain_returns_partial_body_on_read_error() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"error\":")),
            Err(std::io::Error::other("reset")),
        ]);
        let drained = drain_body(chunks, 1024, Duration::from_secs(1)).await;
        assert_eq!(drained.bytes, Bytes::from_static(b"{\"error\":"));
        assert!(drained.failed);
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("content-length", "10".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        remove_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-request-id"));
    }
}
