use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RelayError, Result};

pub const DEFAULT_AFFINITY_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub timeouts: TimeoutConfig,
    pub max_error_body_bytes: usize,
    pub affinity: AffinityConfig,
    pub identity: IdentityConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            max_error_body_bytes: default_max_error_body_bytes(),
            affinity: AffinityConfig::default(),
            identity: IdentityConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        if config.max_error_body_bytes == 0 {
            config.max_error_body_bytes = default_max_error_body_bytes();
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&raw)
    }

    /// Process-environment overrides for values usually injected by the platform.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = get("RELAY_REDIS_URL") {
            self.affinity.url = Some(url);
        }
        if let Some(password) = get("RELAY_REDIS_PASSWORD") {
            self.affinity.password = Some(password);
        }
        if let Some(endpoint) = get("IDENTITY_ENDPOINT") {
            self.identity.endpoint = Some(endpoint);
        }
        if let Some(secret) = get("IDENTITY_HEADER") {
            self.identity.secret = Some(secret);
        }
        self
    }

    pub fn backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|backend| backend.id == id)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(RelayError::Config("backend id must not be empty".to_string()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate backend id: {}",
                    backend.id
                )));
            }
        }
        if self.affinity.ttl_seconds == 0 {
            return Err(RelayError::Config(
                "affinity.ttl_seconds must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_error_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    /// Time allowed until the backend's response headers arrive.
    pub send_timeout_ms: u64,
    /// Time allowed between two body chunks.
    pub read_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            send_timeout_ms: 60_000,
            read_timeout_ms: 120_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    pub url: Option<String>,
    pub password: Option<String>,
    pub key_prefix: String,
    pub ttl_seconds: u64,
    /// Bound on each store round trip (health check, lookup, write-back).
    pub timeout_ms: u64,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            url: None,
            password: None,
            key_prefix: "relay".to_string(),
            ttl_seconds: DEFAULT_AFFINITY_TTL_SECS,
            timeout_ms: 2_000,
        }
    }
}

impl std::fmt::Debug for AffinityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityConfig")
            .field("url", &self.url)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_prefix", &self.key_prefix)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl AffinityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub endpoint: Option<String>,
    pub api_version: String,
    pub secret_header: String,
    pub secret: Option<String>,
    pub resource: String,
    pub client_id: Option<String>,
    pub refresh_margin_seconds: u64,
    /// Bound on one token fetch from the issuer.
    pub timeout_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_version: "2019-08-01".to_string(),
            secret_header: "X-IDENTITY-HEADER".to_string(),
            secret: None,
            resource: "https://cognitiveservices.azure.com".to_string(),
            client_id: None,
            refresh_margin_seconds: DEFAULT_TOKEN_REFRESH_MARGIN_SECS,
            timeout_ms: 10_000,
        }
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("secret_header", &self.secret_header)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("resource", &self.resource)
            .field("client_id", &self.client_id)
            .field("refresh_margin_seconds", &self.refresh_margin_seconds)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl IdentityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    /// Authenticate with a workload-identity bearer token instead of static headers.
    #[serde(default)]
    pub identity: bool,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("headers", &"<redacted>")
            .field("query_params", &self.query_params)
            .field("identity", &self.identity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_with_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
[affinity]
url = "redis://127.0.0.1:6379"
password = "hunter2"

[[backends]]
id = "east"
endpoint = "https://east.example.com"
headers = { "api-key" = "k-east" }
query_params = { "api-version" = "2024-10-21" }

[[backends]]
id = "west"
endpoint = "https://west.example.com"
identity = true
"#,
        )
        .expect("config");

        assert_eq!(config.timeouts.read_timeout_ms, 120_000);
        assert_eq!(config.max_error_body_bytes, 1024 * 1024);
        assert_eq!(config.affinity.ttl_seconds, DEFAULT_AFFINITY_TTL_SECS);
        assert_eq!(config.affinity.key_prefix, "relay");
        assert_eq!(config.identity.refresh_margin_seconds, 60);
        assert_eq!(config.identity.timeout(), Duration::from_secs(10));
        assert_eq!(config.affinity.timeout(), Duration::from_secs(2));
        assert_eq!(config.backends.len(), 2);
        assert!(config.backend("west").is_some_and(|backend| backend.identity));
        assert!(!format!("{:?}", config).contains("hunter2"));
        assert!(!format!("{:?}", config).contains("k-east"));
    }

    #[test]
    fn rejects_duplicate_backend_ids() {
        let err = RelayConfig::from_toml_str(
            r#"
[[backends]]
id = "a"
[[backends]]
id = "a"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate backend id"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let config = RelayConfig::default().apply_env_from(|key| match key {
            "RELAY_REDIS_URL" => Some("redis://cache:6380".to_string()),
            "IDENTITY_ENDPOINT" => Some("http://169.254.169.254/token".to_string()),
            "IDENTITY_HEADER" => Some(" ".to_string()),
            _ => None,
        });
        assert_eq!(config.affinity.url.as_deref(), Some("redis://cache:6380"));
        assert_eq!(
            config.identity.endpoint.as_deref(),
            Some("http://169.254.169.254/token")
        );
        assert!(config.identity.secret.is_none());
    }

    #[tokio::test]
    async fn loads_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.toml");
        tokio::fs::write(&path, "max_error_body_bytes = 4096\n[timeouts]\nsend_timeout_ms = 5\n")
            .await
            .expect("write");
        let config = RelayConfig::load(&path).await.expect("load");
        assert_eq!(config.max_error_body_bytes, 4096);
        assert_eq!(config.timeouts.send_timeout(), Duration::from_millis(5));
    }
}
