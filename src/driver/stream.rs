use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;

use super::{BodyStream, Outcome, RelayParams, next_chunk, write_back_affinity};
use crate::affinity::{AffinityKey, AffinityStore, write_back_keys};
use crate::classify::{ChunkSummary, ResponseClassifier, StreamAccumulator};
use crate::context::{BodyObserver, RequestContext};
use crate::request::RequestKind;
use crate::utils::http::remove_hop_by_hop_headers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamEnd {
    Completed,
    Error,
    Aborted,
}

struct PrescannedChunk {
    chunk: Bytes,
    content_seen: bool,
    /// Elapsed request time when the chunk came off the wire.
    read_at: Duration,
}

/// Upper bound on bytes held back while no complete event has arrived yet.
const PRESCAN_MAX_BUFFERED_BYTES: usize = 512 * 1024;

/// Reads the first chunk with complete events (two for a stateful request that has
/// produced no content yet) before anything is committed, so an embedded retryable
/// error can still fail over. Afterwards the body is relayed unchanged, chunk by chunk.
pub(super) async fn relay_stream(
    params: RelayParams,
    classifier: &'static dyn ResponseClassifier,
    mut upstream: BodyStream,
) -> Outcome {
    let prescan_limit = if params.kind == RequestKind::StatefulResponse {
        2
    } else {
        1
    };

    let mut acc = StreamAccumulator::default();
    let mut prebuffered: VecDeque<PrescannedChunk> = VecDeque::with_capacity(prescan_limit);
    let mut upstream_done = false;
    let mut scanned = 0;
    let mut buffered_bytes = 0;

    while scanned < prescan_limit && buffered_bytes <= PRESCAN_MAX_BUFFERED_BYTES {
        let (chunk, summary) = match next_chunk(&mut upstream, params.read_timeout).await {
            Ok(Some(chunk)) => {
                let summary = acc.ingest(classifier, &chunk);
                (Some(chunk), summary)
            }
            Ok(None) => {
                upstream_done = true;
                (None, acc.finish(classifier))
            }
            Err(err) => return err.into_outcome(),
        };
        let read_at = params.ctx.elapsed();

        if let Some(error) = summary.error.as_ref() {
            params.ctx.record_error_status(error.status);
            if error.is_retryable() {
                tracing::debug!(
                    status = error.status.as_u16(),
                    code = error.code.as_deref().unwrap_or_default(),
                    "embedded backend error before commit; retryable"
                );
                return Outcome::Retry {
                    status: error.status,
                    body: error.body.clone(),
                };
            }
        }

        let Some(chunk) = chunk else {
            // Events completed by end-of-stream belong to the last buffered chunk.
            if summary.content_seen {
                if let Some(last) = prebuffered.back_mut() {
                    last.content_seen = true;
                }
            }
            break;
        };
        if summary.events > 0 {
            scanned += 1;
        }
        buffered_bytes += chunk.len();
        let stop = summary.content_seen || summary.error.is_some() || acc.is_done();
        prebuffered.push_back(PrescannedChunk {
            chunk,
            content_seen: summary.content_seen,
            read_at,
        });
        if stop {
            break;
        }
    }

    let RelayParams {
        ctx,
        kind,
        backend,
        status,
        mut headers,
        read_timeout,
        observers,
        affinity,
        affinity_keys,
        affinity_timeout,
    } = params;
    remove_hop_by_hop_headers(&mut headers);

    let state = RelayStreamState {
        upstream,
        upstream_done,
        prebuffered,
        acc,
        classifier,
        read_timeout,
        observers,
        ctx: ctx.clone(),
        finalizer: Some(StreamFinalizer {
            ctx,
            kind,
            backend,
            affinity,
            affinity_keys,
            affinity_timeout,
        }),
    };

    let stream = futures_util::stream::try_unfold(state, |mut state| async move {
        if let Some(prescanned) = state.prebuffered.pop_front() {
            state.emit(&prescanned.chunk, prescanned.content_seen, prescanned.read_at);
            return Ok(Some((prescanned.chunk, state)));
        }
        if state.upstream_done {
            state.finalize(StreamEnd::Completed).await;
            return Ok(None);
        }

        match next_chunk(&mut state.upstream, state.read_timeout).await {
            Ok(Some(chunk)) => {
                let read_at = state.ctx.elapsed();
                let summary = state.acc.ingest(state.classifier, &chunk);
                state.note_midstream_error(&summary);
                state.emit(&chunk, summary.content_seen, read_at);
                Ok(Some((chunk, state)))
            }
            Ok(None) => {
                state.upstream_done = true;
                state.finalize(StreamEnd::Completed).await;
                Ok(None)
            }
            Err(err) => {
                let err = err.into_io();
                tracing::warn!(error = %err, "backend stream failed after commit");
                state.finalize(StreamEnd::Error).await;
                Err(err)
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Outcome::Relayed(response)
}

struct RelayStreamState {
    upstream: BodyStream,
    upstream_done: bool,
    prebuffered: VecDeque<PrescannedChunk>,
    acc: StreamAccumulator,
    classifier: &'static dyn ResponseClassifier,
    read_timeout: Duration,
    observers: Vec<Arc<dyn BodyObserver>>,
    ctx: RequestContext,
    finalizer: Option<StreamFinalizer>,
}

impl RelayStreamState {
    fn emit(&self, chunk: &Bytes, content_seen: bool, read_at: Duration) {
        if content_seen {
            self.ctx.mark_first_token_at(read_at);
        }
        self.ctx.mark_upstream_progress_at(read_at);
        for observer in &self.observers {
            observer.on_body_chunk(&self.ctx, chunk);
        }
    }

    fn note_midstream_error(&self, summary: &ChunkSummary) {
        if let Some(error) = summary.error.as_ref() {
            tracing::warn!(
                status = error.status.as_u16(),
                code = error.code.as_deref().unwrap_or_default(),
                "backend reported an error after the response was committed"
            );
            self.ctx.record_error_status(error.status);
        }
    }

    async fn finalize(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        if end == StreamEnd::Completed {
            let summary = self.acc.finish(self.classifier);
            self.note_midstream_error(&summary);
            if summary.content_seen {
                self.ctx.mark_first_token();
            }
        }
        finalizer.finalize(&self.acc, end).await;
    }
}

impl Drop for RelayStreamState {
    fn drop(&mut self) {
        // Client went away before the body ended: keep what was accounted so far.
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.record_accounting(&self.acc, StreamEnd::Aborted);
        }
    }
}

struct StreamFinalizer {
    ctx: RequestContext,
    kind: RequestKind,
    backend: String,
    affinity: Option<Arc<dyn AffinityStore>>,
    affinity_keys: Vec<AffinityKey>,
    affinity_timeout: Duration,
}

impl StreamFinalizer {
    fn record_accounting(&self, acc: &StreamAccumulator, end: StreamEnd) {
        self.ctx.record_usage(acc.usage(), acc.text());
        if end != StreamEnd::Completed {
            tracing::debug!(?end, backend = %self.backend, "relayed stream ended early");
        }
    }

    async fn finalize(self, acc: &StreamAccumulator, end: StreamEnd) {
        self.record_accounting(acc, end);

        if self.kind != RequestKind::StatefulResponse
            || end != StreamEnd::Completed
            || acc.last_error.is_some()
        {
            return;
        }
        let Some(store) = self.affinity.as_deref() else {
            return;
        };
        let keys = write_back_keys(&self.affinity_keys, acc.response_id(), acc.conversation_id());
        write_back_affinity(store, &keys, &self.backend, self.affinity_timeout).await;
    }
}
