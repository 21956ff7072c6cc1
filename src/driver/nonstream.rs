use axum::body::Body;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

use super::{BodyStream, Outcome, ReadError, RelayParams, next_chunk, write_back_affinity};
use crate::affinity::write_back_keys;
use crate::classify::classifier_for;
use crate::request::RequestKind;
use crate::utils::http::remove_hop_by_hop_headers;

pub(super) async fn read_body(
    mut upstream: BodyStream,
    read_timeout: Duration,
) -> Result<Bytes, ReadError> {
    let mut out = BytesMut::new();
    while let Some(chunk) = next_chunk(&mut upstream, read_timeout).await? {
        out.extend_from_slice(chunk.as_ref());
    }
    Ok(out.freeze())
}

/// Classifies a whole body once, hands it to the observers once and relays it unchanged.
pub(super) async fn relay_body(params: RelayParams, body: Bytes) -> Outcome {
    let RelayParams {
        ctx,
        kind,
        backend,
        status,
        mut headers,
        observers,
        affinity,
        affinity_keys,
        affinity_timeout,
        ..
    } = params;

    ctx.mark_upstream_progress();
    let summary = classifier_for(kind).summarize_body(&body);
    ctx.record_usage(summary.usage, summary.text.clone());
    for observer in &observers {
        observer.on_body_chunk(&ctx, &body);
    }

    if kind == RequestKind::StatefulResponse && status.is_success() {
        if let Some(store) = affinity.as_deref() {
            let keys = write_back_keys(
                &affinity_keys,
                summary.response_id.as_deref(),
                summary.conversation_id.as_deref(),
            );
            write_back_affinity(store, &keys, &backend, affinity_timeout).await;
        }
    }

    remove_hop_by_hop_headers(&mut headers);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Outcome::Relayed(response)
}
