//! One attempt against one backend: preflight, send, classify, relay or signal retry.

mod nonstream;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tracing::Instrument;

use crate::affinity::{AffinityError, AffinityKey, AffinityStore, collect_affinity_keys};
use crate::classify::classifier_for;
use crate::config::{RelayConfig, TimeoutConfig};
use crate::context::{BodyObserver, RequestContext};
use crate::identity::{IdentityError, IdentityTokenCache};
use crate::request::{
    BackendTarget, RequestEnvelope, RequestKind, apply_bearer_token, outbound_headers,
};
use crate::utils::http::{drain_body, is_event_stream};
use crate::{RelayError, Result};

pub(crate) type BodyStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// Body fragments that mark a 400 from a backend that does not hold the referenced state.
const STATE_MISMATCH_SIGNATURES: &[&str] = &[
    "invalid_encrypted_content",
    "could not be decrypted",
    "could not be verified",
];

/// Result of one attempt. `Retry` means nothing reached the client and another backend
/// may be tried; the body is kept so the last real error can still be surfaced.
#[derive(Debug)]
pub enum Outcome {
    Relayed(Response),
    Retry { status: StatusCode, body: Bytes },
}

impl Outcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Relayed(response) => response.status(),
            Self::Retry { status, .. } => *status,
        }
    }

    /// Client response for this outcome; a `Retry` becomes its preserved error.
    pub fn into_response(self) -> Response {
        match self {
            Self::Relayed(response) => response,
            Self::Retry { status, body } => {
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                response
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

fn openai_error_body(
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> Bytes {
    let envelope = ErrorEnvelope {
        error: ErrorDetail {
            message: message.to_string(),
            kind,
            code,
        },
    };
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":{\"type\":\"api_error\"}}"))
}

fn openai_error_response(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> Response {
    let mut response = Response::new(Body::from(openai_error_body(kind, code, message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn retry_error(status: StatusCode, code: &'static str, message: impl std::fmt::Display) -> Outcome {
    Outcome::Retry {
        status,
        body: openai_error_body("api_error", Some(code), message),
    }
}

fn is_state_mismatch_body(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    STATE_MISMATCH_SIGNATURES
        .iter()
        .any(|signature| text.contains(signature))
}

#[derive(Debug)]
pub(crate) enum ReadError {
    Timeout(Duration),
    Io(std::io::Error),
}

impl ReadError {
    fn into_outcome(self) -> Outcome {
        match self {
            Self::Timeout(timeout) => retry_error(
                StatusCode::GATEWAY_TIMEOUT,
                "backend_timeout",
                format!("backend read timed out after {}ms", timeout.as_millis()),
            ),
            Self::Io(err) => retry_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "backend_read_failed",
                format!("backend read failed: {err}"),
            ),
        }
    }

    fn into_io(self) -> std::io::Error {
        match self {
            Self::Timeout(timeout) => std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("backend read timed out after {}ms", timeout.as_millis()),
            ),
            Self::Io(err) => err,
        }
    }
}

pub(crate) async fn next_chunk(
    stream: &mut BodyStream,
    read_timeout: Duration,
) -> std::result::Result<Option<Bytes>, ReadError> {
    match tokio::time::timeout(read_timeout, stream.next()).await {
        Err(_) => Err(ReadError::Timeout(read_timeout)),
        Ok(None) => Ok(None),
        Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
        Ok(Some(Err(err))) => Err(ReadError::Io(err)),
    }
}

/// Runs one affinity store call under `limit`; an expired call counts as unavailable.
pub(crate) async fn store_call<T>(
    limit: Duration,
    call: impl std::future::Future<Output = std::result::Result<T, AffinityError>>,
) -> std::result::Result<T, AffinityError> {
    tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
        Err(AffinityError::Unavailable(format!(
            "affinity store did not answer within {}ms",
            limit.as_millis()
        )))
    })
}

pub(crate) async fn write_back_affinity(
    store: &dyn AffinityStore,
    keys: &[AffinityKey],
    backend: &str,
    limit: Duration,
) {
    if keys.is_empty() {
        return;
    }
    if let Err(err) = store_call(limit, store.record(keys, backend)).await {
        tracing::warn!(error = %err, backend, keys = keys.len(), "affinity write-back failed");
    }
}

/// Everything a relay path needs once the backend has answered.
pub(crate) struct RelayParams {
    pub(crate) ctx: RequestContext,
    pub(crate) kind: RequestKind,
    pub(crate) backend: String,
    pub(crate) status: StatusCode,
    pub(crate) headers: axum::http::HeaderMap,
    pub(crate) read_timeout: Duration,
    pub(crate) observers: Vec<Arc<dyn BodyObserver>>,
    pub(crate) affinity: Option<Arc<dyn AffinityStore>>,
    pub(crate) affinity_keys: Vec<AffinityKey>,
    pub(crate) affinity_timeout: Duration,
}

pub struct RelayDriver {
    http: reqwest::Client,
    timeouts: TimeoutConfig,
    max_error_body_bytes: usize,
    affinity: Option<Arc<dyn AffinityStore>>,
    affinity_timeout: Duration,
    identity: Option<Arc<IdentityTokenCache>>,
    observers: Vec<Arc<dyn BodyObserver>>,
}

impl std::fmt::Debug for RelayDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDriver")
            .field("timeouts", &self.timeouts)
            .field("max_error_body_bytes", &self.max_error_body_bytes)
            .field("affinity", &self.affinity.is_some())
            .field("affinity_timeout", &self.affinity_timeout)
            .field("identity", &self.identity.is_some())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl RelayDriver {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect_timeout())
            .build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: &RelayConfig) -> Self {
        Self {
            http,
            timeouts: config.timeouts,
            max_error_body_bytes: config.max_error_body_bytes,
            affinity: None,
            affinity_timeout: config.affinity.timeout(),
            identity: None,
            observers: Vec::new(),
        }
    }

    /// Driver with the identity cache and (when compiled in) the redis affinity store
    /// that `config` describes.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let mut driver = Self::new(config)?;
        if config.identity.endpoint.is_some() {
            let cache = IdentityTokenCache::from_config(&config.identity, driver.http.clone());
            driver = driver.with_identity_cache(Arc::new(cache));
        }
        #[cfg(feature = "affinity-redis")]
        if config.affinity.url.is_some() {
            let store = crate::affinity::RedisAffinityStore::from_config(&config.affinity)
                .map_err(|err| RelayError::Config(err.to_string()))?;
            driver = driver.with_affinity_store(Arc::new(store));
        }
        Ok(driver)
    }

    pub fn with_affinity_store(mut self, store: Arc<dyn AffinityStore>) -> Self {
        self.affinity = Some(store);
        self
    }

    pub fn with_identity_cache(mut self, cache: Arc<IdentityTokenCache>) -> Self {
        self.identity = Some(cache);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BodyObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub async fn attempt(
        &self,
        ctx: &RequestContext,
        request: &RequestEnvelope,
        target: &BackendTarget,
    ) -> Outcome {
        let kind = request.kind();
        let span = tracing::info_span!(
            "relay_attempt",
            backend = %target.id,
            kind = kind.as_str(),
            status = tracing::field::Empty,
        );
        self.run_attempt(ctx, request, target, kind)
            .instrument(span)
            .await
    }

    async fn run_attempt(
        &self,
        ctx: &RequestContext,
        request: &RequestEnvelope,
        target: &BackendTarget,
        kind: RequestKind,
    ) -> Outcome {
        let url = match target.url_for(&request.path, &request.query) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, "backend target rejected");
                return Outcome::Relayed(openai_error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    Some("invalid_backend"),
                    err,
                ));
            }
        };
        let body = match request.body.as_ref().map(serde_json::to_vec).transpose() {
            Ok(body) => body,
            Err(err) => {
                return Outcome::Relayed(openai_error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    Some("invalid_body"),
                    RelayError::from(err),
                ));
            }
        };

        let mut headers = outbound_headers(&request.headers, &target.headers, body.is_some());
        if target.identity || request.identity_requested() {
            if let Err(outcome) = self.apply_identity(&mut headers).await {
                return outcome;
            }
        }

        let affinity_keys = if kind == RequestKind::StatefulResponse {
            match self.check_affinity(request, target).await {
                Ok(keys) => keys,
                Err(outcome) => return outcome,
            }
        } else {
            Vec::new()
        };

        ctx.begin_attempt(&target.id);
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let send_timeout = self.timeouts.send_timeout();
        let response = match tokio::time::timeout(send_timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "backend request failed");
                return if err.is_timeout() {
                    retry_error(StatusCode::GATEWAY_TIMEOUT, "backend_timeout", err)
                } else {
                    retry_error(StatusCode::INTERNAL_SERVER_ERROR, "backend_unreachable", err)
                };
            }
            Err(_) => {
                tracing::warn!(timeout_ms = send_timeout.as_millis() as u64, "backend send timed out");
                return retry_error(
                    StatusCode::GATEWAY_TIMEOUT,
                    "backend_timeout",
                    format!("backend did not respond within {}ms", send_timeout.as_millis()),
                );
            }
        };

        let status = response.status();
        tracing::Span::current().record("status", status.as_u16());
        ctx.record_status(status);

        let response_headers = response.headers().clone();
        let upstream: BodyStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        let read_timeout = self.timeouts.read_timeout();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let drained = drain_body(upstream, self.max_error_body_bytes, read_timeout).await;
            ctx.record_error_status(status);
            tracing::debug!(
                status = status.as_u16(),
                truncated = drained.truncated,
                drain_failed = drained.failed,
                "backend status is retryable"
            );
            return Outcome::Retry {
                status,
                body: drained.bytes,
            };
        }

        let params = RelayParams {
            ctx: ctx.clone(),
            kind,
            backend: target.id.clone(),
            status,
            headers: response_headers,
            read_timeout,
            observers: self.observers.clone(),
            affinity: self.affinity.clone(),
            affinity_keys,
            affinity_timeout: self.affinity_timeout,
        };

        if status.is_client_error() {
            ctx.record_error_status(status);
        }

        if status == StatusCode::BAD_REQUEST && kind == RequestKind::StatefulResponse {
            let body = match nonstream::read_body(upstream, read_timeout).await {
                Ok(body) => body,
                Err(err) => return err.into_outcome(),
            };
            if is_state_mismatch_body(&body) {
                tracing::debug!("backend cannot decrypt referenced state; retryable");
                return Outcome::Retry { status, body };
            }
            return nonstream::relay_body(params, body).await;
        }

        if is_event_stream(&params.headers) {
            stream::relay_stream(params, classifier_for(kind), upstream).await
        } else {
            match nonstream::read_body(upstream, read_timeout).await {
                Ok(body) => nonstream::relay_body(params, body).await,
                Err(err) => err.into_outcome(),
            }
        }
    }

    async fn apply_identity(
        &self,
        headers: &mut axum::http::HeaderMap,
    ) -> std::result::Result<(), Outcome> {
        let Some(cache) = self.identity.as_ref() else {
            tracing::warn!("identity auth requested but no identity cache is configured");
            return Err(retry_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "identity_unavailable",
                "identity auth is not configured",
            ));
        };
        let limit = self.timeouts.send_timeout();
        let token = tokio::time::timeout(limit, cache.default_token())
            .await
            .unwrap_or_else(|_| Err(IdentityError::Timeout(limit)))
            .map_err(|err| {
                tracing::warn!(error = %err, "identity token fetch failed");
                retry_error(StatusCode::INTERNAL_SERVER_ERROR, "identity_unavailable", err)
            })?;
        apply_bearer_token(headers, &token).map_err(|err| {
            retry_error(StatusCode::INTERNAL_SERVER_ERROR, "identity_unavailable", err)
        })
    }

    async fn check_affinity(
        &self,
        request: &RequestEnvelope,
        target: &BackendTarget,
    ) -> std::result::Result<Vec<AffinityKey>, Outcome> {
        let keys = collect_affinity_keys(request);
        let Some(store) = self.affinity.as_ref() else {
            return Ok(keys);
        };

        if let Err(err) = store_call(self.affinity_timeout, store.health_check()).await {
            tracing::warn!(error = %err, "affinity store health check failed");
            return Err(retry_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "affinity_unavailable",
                err,
            ));
        }
        if keys.is_empty() {
            return Ok(keys);
        }

        match store_call(self.affinity_timeout, store.lookup(&keys)).await {
            Ok(Some(owner)) if owner != target.id => {
                tracing::debug!(owner = %owner, "affinity names another backend");
                Err(retry_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "affinity_mismatch",
                    format!("conversation state is held by backend {owner}"),
                ))
            }
            Ok(_) => Ok(keys),
            Err(err) => {
                tracing::warn!(error = %err, "affinity lookup failed");
                Err(retry_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "affinity_unavailable",
                    err,
                ))
            }
        }
    }
}
