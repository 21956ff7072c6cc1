use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::Value;
use url::Url;

use crate::config::BackendConfig;
use crate::utils::http::HOP_BY_HOP_HEADERS;
use crate::{RelayError, Result};

/// Headers starting with this prefix carry instructions from the gateway to the driver and
/// never leave the process.
pub const INTERNAL_HEADER_PREFIX: &str = "x-relay-";
/// `x-relay-auth: identity` asks the driver to swap key auth for a workload-identity token.
pub const AUTH_MODE_HEADER: &str = "x-relay-auth";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Chat,
    Embeddings,
    StatefulResponse,
    Unclassified,
}

impl RequestKind {
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        if path.contains("/chat/completions") {
            Self::Chat
        } else if path.contains("/embeddings") {
            Self::Embeddings
        } else if path.contains("/responses") {
            Self::StatefulResponse
        } else {
            Self::Unclassified
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Embeddings => "embeddings",
            Self::StatefulResponse => "stateful-response",
            Self::Unclassified => "unclassified",
        }
    }
}

/// An already-authenticated client request, as handed over by the gateway.
#[derive(Clone, Debug)]
pub struct RequestEnvelope {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::from_path(&self.path)
    }

    pub fn identity_requested(&self) -> bool {
        self.headers
            .get(AUTH_MODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("identity"))
    }
}

/// One backend as resolved by the gateway for a single attempt.
#[derive(Clone, Debug)]
pub struct BackendTarget {
    pub id: String,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub query_params: BTreeMap<String, String>,
    pub identity: bool,
}

impl BackendTarget {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            headers: HeaderMap::new(),
            query_params: BTreeMap::new(),
            identity: false,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(Self::new(&config.id, &config.endpoint)
            .with_headers(&config.headers)?
            .with_query_params(&config.query_params)
            .with_identity(config.identity))
    }

    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Result<Self> {
        self.headers = parse_headers(headers)?;
        Ok(self)
    }

    pub fn with_query_params(mut self, params: &BTreeMap<String, String>) -> Self {
        self.query_params = params
            .iter()
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .filter(|(name, _)| !name.is_empty())
            .collect();
        self
    }

    pub fn with_identity(mut self, identity: bool) -> Self {
        self.identity = identity;
        self
    }

    /// Validates the endpoint and builds the full URL for `path`.
    pub(crate) fn url_for(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut base = Url::parse(self.endpoint.trim()).map_err(|err| {
            RelayError::Config(format!(
                "backend {} has an invalid endpoint {:?}: {err}",
                self.id, self.endpoint
            ))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "backend {} endpoint must use http or https, got {:?}",
                self.id,
                base.scheme()
            )));
        }
        if base.host_str().is_none_or(str::is_empty) {
            return Err(RelayError::Config(format!(
                "backend {} endpoint is missing a host",
                self.id
            )));
        }

        // Endpoint query pairs rank like configured params, below `query_params`.
        let endpoint_pairs: Vec<(String, String)> = base
            .query_pairs()
            .into_owned()
            .filter(|(name, _)| !self.query_params.contains_key(name))
            .collect();
        base.set_query(None);
        base.set_fragment(None);

        let joined = join_base_url(base.as_str(), path);
        let mut url = Url::parse(&joined).map_err(|err| {
            RelayError::Config(format!("invalid request path {path:?}: {err}"))
        })?;

        let mut pairs: Vec<(String, String)> = query
            .iter()
            .filter(|(name, _)| {
                !self.query_params.contains_key(name)
                    && !endpoint_pairs.iter().any(|(configured, _)| configured == name)
            })
            .cloned()
            .collect();
        pairs.extend(endpoint_pairs);
        pairs.extend(
            self.query_params
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        Ok(url)
    }
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.split('?').next().unwrap_or(path);
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // A base that already ends in /v1 still accepts /v1/* request paths.
    if base.ends_with("/v1") {
        if path_no_leading_slash == "v1" {
            return base.to_string();
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}/{path_no_leading_slash}")
}

pub fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let header_name = name
            .parse::<HeaderName>()
            .map_err(|_| RelayError::Config(format!("invalid header name: {name}")))?;
        let header_value = value
            .parse::<HeaderValue>()
            .map_err(|_| RelayError::Config(format!("invalid header value for {name}")))?;
        out.insert(header_name, header_value);
    }
    Ok(out)
}

fn is_forwarding_header(name: &str) -> bool {
    name == "host"
        || name == "forwarded"
        || name == "x-real-ip"
        || name.starts_with("x-forwarded-")
}

/// Caller headers minus hop-by-hop, forwarding and internal ones, overlaid with the
/// target's configured headers. Configured values replace caller values of the same name.
pub(crate) fn outbound_headers(caller: &HeaderMap, target: &HeaderMap, has_body: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in caller {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower)
            || is_forwarding_header(lower)
            || lower.starts_with(INTERNAL_HEADER_PREFIX)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    for name in target.keys() {
        out.remove(name);
    }
    for (name, value) in target {
        if name.as_str().starts_with(INTERNAL_HEADER_PREFIX) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if has_body {
        out.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    out
}

/// Replaces key-based credentials with a bearer token.
pub(crate) fn apply_bearer_token(headers: &mut HeaderMap, token: &str) -> Result<()> {
    headers.remove("api-key");
    headers.remove("x-api-key");
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| RelayError::InvalidResponse("identity token is not a valid header".to_string()))?;
    headers.insert(axum::http::header::AUTHORIZATION, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_kind_from_path() {
        assert_eq!(RequestKind::from_path("/v1/chat/completions"), RequestKind::Chat);
        assert_eq!(
            RequestKind::from_path("/openai/deployments/gpt/chat/completions?api-version=1"),
            RequestKind::Chat
        );
        assert_eq!(RequestKind::from_path("/v1/embeddings"), RequestKind::Embeddings);
        assert_eq!(
            RequestKind::from_path("/v1/responses/resp_1/input_items"),
            RequestKind::StatefulResponse
        );
        assert_eq!(RequestKind::from_path("/v1/models"), RequestKind::Unclassified);
    }

    #[test]
    fn url_for_rejects_missing_scheme_or_host() {
        let no_scheme = BackendTarget::new("a", "east.example.com");
        assert!(matches!(
            no_scheme.url_for("/v1/chat/completions", &[]),
            Err(RelayError::Config(_))
        ));
        let bad_scheme = BackendTarget::new("a", "ftp://east.example.com");
        assert!(bad_scheme.url_for("/v1/chat/completions", &[]).is_err());
        let empty = BackendTarget::new("a", "");
        assert!(empty.url_for("/v1/chat/completions", &[]).is_err());
    }

    #[test]
    fn url_for_moves_endpoint_query_after_the_path() {
        let target = BackendTarget::new("a", "https://h.example.com/openai?api-version=x&deployment=d");
        let url = target
            .url_for(
                "/v1/chat/completions",
                &[
                    ("api-version".to_string(), "caller".to_string()),
                    ("trace".to_string(), "1".to_string()),
                ],
            )
            .expect("url");
        assert_eq!(url.path(), "/openai/v1/chat/completions");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("trace".to_string(), "1".to_string()),
                ("api-version".to_string(), "x".to_string()),
                ("deployment".to_string(), "d".to_string()),
            ]
        );

        let params = BTreeMap::from([("api-version".to_string(), "y".to_string())]);
        let url = target
            .with_query_params(&params)
            .url_for("/v1/embeddings", &[])
            .expect("url");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("deployment".to_string(), "d".to_string()),
                ("api-version".to_string(), "y".to_string()),
            ]
        );
    }

    #[test]
    fn url_for_joins_path_and_merges_query() {
        let params = BTreeMap::from([("api-version".to_string(), "2024-10-21".to_string())]);
        let target =
            BackendTarget::new("a", "https://east.example.com:8443/v1/").with_query_params(&params);
        let url = target
            .url_for(
                "/v1/chat/completions",
                &[
                    ("api-version".to_string(), "old".to_string()),
                    ("trace".to_string(), "1".to_string()),
                ],
            )
            .expect("url");
        assert_eq!(url.host_str(), Some("east.example.com"));
        assert_eq!(url.port(), Some(8443));
        assert_eq!(url.path(), "/v1/chat/completions");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("trace".to_string(), "1".to_string()),
                ("api-version".to_string(), "2024-10-21".to_string()),
            ]
        );
    }

    #[test]
    fn outbound_headers_filter_and_prefer_configured_values() {
        let mut caller = HeaderMap::new();
        caller.insert("host", "gateway.local".parse().unwrap());
        caller.insert("content-length", "12".parse().unwrap());
        caller.insert("x-forwarded-for", "10.0.0.1".parse().unwrap());
        caller.insert("x-relay-auth", "identity".parse().unwrap());
        caller.insert("api-key", "client-key".parse().unwrap());
        caller.insert("content-type", "text/plain".parse().unwrap());
        caller.insert("x-ms-client-request-id", "abc".parse().unwrap());

        let mut target = HeaderMap::new();
        target.insert("api-key", "backend-key".parse().unwrap());

        let out = outbound_headers(&caller, &target, true);
        assert!(out.get("host").is_none());
        assert!(out.get("content-length").is_none());
        assert!(out.get("x-forwarded-for").is_none());
        assert!(out.get("x-relay-auth").is_none());
        assert_eq!(out.get("api-key").unwrap(), "backend-key");
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-ms-client-request-id").unwrap(), "abc");
    }

    #[test]
    fn bearer_token_replaces_key_auth() {
        let mut headers = HeaderMap::new();
        headers.insert("api-key", "k".parse().unwrap());
        apply_bearer_token(&mut headers, "tok").expect("bearer");
        assert!(headers.get("api-key").is_none());
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn identity_flag_is_read_from_internal_header() {
        let request = RequestEnvelope::new(Method::POST, "/v1/chat/completions").with_header(
            HeaderName::from_static(AUTH_MODE_HEADER),
            HeaderValue::from_static("Identity"),
        );
        assert!(request.identity_requested());
    }
}
