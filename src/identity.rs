//! Workload-identity bearer tokens, fetched from a metadata-style issuer and cached
//! until shortly before they expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{DEFAULT_TOKEN_REFRESH_MARGIN_SECS, IdentityConfig};

/// Expiry values below this are relative seconds, not epoch timestamps.
const EPOCH_THRESHOLD_SECS: u64 = 1_000_000_000;

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        now.as_secs()
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity is not configured: {0}")]
    Config(String),
    #[error("identity request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid identity response: {0}")]
    InvalidResponse(String),
    #[error("identity token fetch timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Cache key: one token per issuer, client and audience.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenRequest {
    pub endpoint: String,
    pub resource: String,
    pub client_id: Option<String>,
}

#[derive(Clone)]
pub struct IdentityToken {
    pub access_token: String,
    pub expires_at: u64,
}

impl std::fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn fetch(&self, request: &TokenRequest) -> Result<IdentityToken, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_on: Option<Value>,
    #[serde(default)]
    expires_in: Option<Value>,
}

fn seconds_value(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Normalises `expires_on` (absolute, or relative when small) and `expires_in`
/// (relative) to absolute epoch seconds.
fn expires_at(parsed: &TokenResponse, now: u64) -> Option<u64> {
    if let Some(expires_on) = seconds_value(parsed.expires_on.as_ref()) {
        return Some(if expires_on < EPOCH_THRESHOLD_SECS {
            now.saturating_add(expires_on)
        } else {
            expires_on
        });
    }
    seconds_value(parsed.expires_in.as_ref()).map(|expires_in| now.saturating_add(expires_in))
}

/// Metadata-service issuer: `GET {endpoint}?resource=..&api-version=..[&client_id=..]`
/// with an optional pre-shared secret header.
pub struct ManagedIdentityIssuer {
    http: reqwest::Client,
    timeout: Duration,
    api_version: String,
    secret_header: String,
    secret: Option<String>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ManagedIdentityIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIdentityIssuer")
            .field("timeout", &self.timeout)
            .field("api_version", &self.api_version)
            .field("secret_header", &self.secret_header)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ManagedIdentityIssuer {
    pub fn new(http: reqwest::Client) -> Self {
        let defaults = IdentityConfig::default();
        Self {
            http,
            timeout: defaults.timeout(),
            api_version: defaults.api_version,
            secret_header: defaults.secret_header,
            secret: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &IdentityConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: config.timeout(),
            api_version: config.api_version.clone(),
            secret_header: config.secret_header.clone(),
            secret: config.secret.clone(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound on the whole issuer round trip, body included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn http_error(&self, err: reqwest::Error) -> IdentityError {
        if err.is_timeout() {
            IdentityError::Timeout(self.timeout)
        } else {
            IdentityError::Http(err)
        }
    }
}

#[async_trait]
impl TokenIssuer for ManagedIdentityIssuer {
    async fn fetch(&self, request: &TokenRequest) -> Result<IdentityToken, IdentityError> {
        let mut query = vec![
            ("resource", request.resource.as_str()),
            ("api-version", self.api_version.as_str()),
        ];
        if let Some(client_id) = request.client_id.as_deref().filter(|id| !id.trim().is_empty()) {
            query.push(("client_id", client_id));
        }

        let mut req = self
            .http
            .get(request.endpoint.as_str())
            .query(&query)
            .timeout(self.timeout)
            .header("Metadata", "true");
        if let Some(secret) = self.secret.as_deref().filter(|secret| !secret.is_empty()) {
            req = req.header(self.secret_header.as_str(), secret);
        }

        let response = req.send().await.map_err(|err| self.http_error(err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = response
            .json::<TokenResponse>()
            .await
            .map_err(|err| self.http_error(err))?;
        let access_token = parsed
            .access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                IdentityError::InvalidResponse("response missing access_token".to_string())
            })?;
        let expires_at = expires_at(&parsed, self.clock.now_epoch_seconds()).ok_or_else(|| {
            IdentityError::InvalidResponse("response missing expires_on/expires_in".to_string())
        })?;

        Ok(IdentityToken {
            access_token,
            expires_at,
        })
    }
}

type TokenSlot = Arc<AsyncMutex<Option<IdentityToken>>>;

/// Tokens keyed by [`TokenRequest`]. A token is refetched once its remaining validity
/// drops to the refresh margin; concurrent callers for the same key wait for a single
/// fetch, other keys are not blocked by it.
pub struct IdentityTokenCache {
    issuer: Arc<dyn TokenIssuer>,
    clock: Arc<dyn Clock>,
    refresh_margin_secs: u64,
    fetch_timeout: Option<Duration>,
    default_request: Option<TokenRequest>,
    slots: std::sync::Mutex<HashMap<TokenRequest, TokenSlot>>,
}

impl std::fmt::Debug for IdentityTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityTokenCache")
            .field("refresh_margin_secs", &self.refresh_margin_secs)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("default_request", &self.default_request)
            .finish()
    }
}

impl IdentityTokenCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            issuer,
            clock: Arc::new(SystemClock),
            refresh_margin_secs: DEFAULT_TOKEN_REFRESH_MARGIN_SECS,
            fetch_timeout: None,
            default_request: None,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// A cache over [`ManagedIdentityIssuer`] whose default request comes from `[identity]`.
    pub fn from_config(config: &IdentityConfig, http: reqwest::Client) -> Self {
        let issuer = ManagedIdentityIssuer::from_config(config, http);
        let mut cache = Self::new(Arc::new(issuer))
            .with_refresh_margin(config.refresh_margin_seconds)
            .with_fetch_timeout(config.timeout());
        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            cache = cache.with_default_request(TokenRequest {
                endpoint: endpoint.to_string(),
                resource: config.resource.clone(),
                client_id: config.client_id.clone(),
            });
        }
        cache
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_refresh_margin(mut self, secs: u64) -> Self {
        self.refresh_margin_secs = secs;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn with_default_request(mut self, request: TokenRequest) -> Self {
        self.default_request = Some(request);
        self
    }

    /// Token for the configured default issuer/resource/client.
    pub async fn default_token(&self) -> Result<String, IdentityError> {
        let request = self.default_request.as_ref().ok_or_else(|| {
            IdentityError::Config("identity.endpoint is not set".to_string())
        })?;
        self.token(request).await
    }

    pub async fn token(&self, request: &TokenRequest) -> Result<String, IdentityError> {
        let slot = self.slot(request);
        let mut cached = slot.lock().await;
        let now = self.clock.now_epoch_seconds();
        if let Some(token) = cached.as_ref() {
            if token.expires_at.saturating_sub(now) > self.refresh_margin_secs {
                return Ok(token.access_token.clone());
            }
        }

        tracing::debug!(
            endpoint = %request.endpoint,
            resource = %request.resource,
            "fetching identity token"
        );
        let fetched = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, self.issuer.fetch(request))
                .await
                .unwrap_or_else(|_| Err(IdentityError::Timeout(limit))),
            None => self.issuer.fetch(request).await,
        };
        match fetched {
            Ok(token) => {
                let access_token = token.access_token.clone();
                *cached = Some(token);
                Ok(access_token)
            }
            Err(err) => {
                *cached = None;
                Err(err)
            }
        }
    }

    fn slot(&self, request: &TokenRequest) -> TokenSlot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(request.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn set(&self, now: u64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_epoch_seconds(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct CountingIssuer {
        clock: Arc<ManualClock>,
        lifetime: u64,
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TokenIssuer for CountingIssuer {
        async fn fetch(&self, request: &TokenRequest) -> Result<IdentityToken, IdentityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(IdentityError::Status {
                    status: 500,
                    body: "unavailable".to_string(),
                });
            }
            Ok(IdentityToken {
                access_token: format!("{}-{n}", request.resource),
                expires_at: self.clock.now_epoch_seconds() + self.lifetime,
            })
        }
    }

    fn request(resource: &str) -> TokenRequest {
        TokenRequest {
            endpoint: "http://169.254.169.254/msi/token".to_string(),
            resource: resource.to_string(),
            client_id: None,
        }
    }

    fn cache(lifetime: u64) -> (Arc<ManualClock>, Arc<CountingIssuer>, IdentityTokenCache) {
        let clock = Arc::new(ManualClock::default());
        clock.set(1_700_000_000);
        let issuer = Arc::new(CountingIssuer {
            clock: clock.clone(),
            lifetime,
            calls: AtomicUsize::new(0),
            fail: std::sync::atomic::AtomicBool::new(false),
        });
        let cache = IdentityTokenCache::new(issuer.clone()).with_clock(clock.clone());
        (clock, issuer, cache)
    }

    #[tokio::test]
    async fn serves_cached_token_until_refresh_margin() {
        let (clock, issuer, cache) = cache(3600);
        let req = request("https://cognitiveservices.azure.com");

        assert_eq!(
            cache.token(&req).await.expect("token"),
            "https://cognitiveservices.azure.com-1"
        );
        clock.set(1_700_000_000 + 3000);
        cache.token(&req).await.expect("token");
        clock.set(1_700_000_000 + 3539);
        cache.token(&req).await.expect("token");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);

        clock.set(1_700_000_000 + 3540);
        assert_eq!(
            cache.token(&req).await.expect("token"),
            "https://cognitiveservices.azure.com-2"
        );
        cache.token(&req).await.expect("token");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn keys_tokens_by_resource_and_client() {
        let (_clock, issuer, cache) = cache(3600);
        let a = request("res-a");
        let mut b = request("res-a");
        b.client_id = Some("client-b".to_string());

        cache.token(&a).await.expect("a");
        cache.token(&b).await.expect("b");
        cache.token(&a).await.expect("a again");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failure_never_returns_stale_token() {
        let (clock, issuer, cache) = cache(120);
        let req = request("res");
        cache.token(&req).await.expect("token");

        clock.set(1_700_000_000 + 90);
        issuer.fail.store(true, Ordering::SeqCst);
        let err = cache.token(&req).await.unwrap_err();
        assert!(matches!(err, IdentityError::Status { status: 500, .. }));
        assert!(cache.token(&req).await.is_err());
    }

    /// Never answers for resource `slow`; answers immediately otherwise.
    struct StallingIssuer;

    #[async_trait]
    impl TokenIssuer for StallingIssuer {
        async fn fetch(&self, request: &TokenRequest) -> Result<IdentityToken, IdentityError> {
            if request.resource == "slow" {
                std::future::pending::<()>().await;
            }
            Ok(IdentityToken {
                access_token: format!("tok-{}", request.resource),
                expires_at: u64::MAX / 2,
            })
        }
    }

    #[tokio::test]
    async fn stalled_fetch_times_out_and_is_not_cached() {
        let cache = IdentityTokenCache::new(Arc::new(StallingIssuer))
            .with_fetch_timeout(Duration::from_millis(20));
        let err = cache.token(&request("slow")).await.unwrap_err();
        assert!(matches!(err, IdentityError::Timeout(limit) if limit == Duration::from_millis(20)));
        assert!(matches!(
            cache.token(&request("slow")).await.unwrap_err(),
            IdentityError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn stalled_fetch_does_not_block_other_keys() {
        let cache = Arc::new(IdentityTokenCache::new(Arc::new(StallingIssuer)));
        let stalled = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.token(&request("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let token = tokio::time::timeout(Duration::from_millis(500), cache.token(&request("fast")))
            .await
            .expect("other key must not wait for the stalled fetch")
            .expect("token");
        assert_eq!(token, "tok-fast");
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn default_token_requires_endpoint() {
        let (_clock, _issuer, cache) = cache(3600);
        assert!(matches!(
            cache.default_token().await.unwrap_err(),
            IdentityError::Config(_)
        ));
    }

    #[test]
    fn expiry_accepts_absolute_and_relative_forms() {
        let now = 1_700_000_000;
        let parse = |raw: &str| -> Option<u64> {
            let parsed: TokenResponse = serde_json::from_str(raw).expect("json");
            expires_at(&parsed, now)
        };
        assert_eq!(parse(r#"{"expires_on":"1700003600"}"#), Some(1_700_003_600));
        assert_eq!(parse(r#"{"expires_on":1700003600}"#), Some(1_700_003_600));
        assert_eq!(parse(r#"{"expires_in":"3599"}"#), Some(now + 3599));
        assert_eq!(parse(r#"{"expires_on":600}"#), Some(now + 600));
        assert_eq!(parse(r#"{}"#), None);
    }
}
