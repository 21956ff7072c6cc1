use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use super::{AffinityError, AffinityKey, AffinityStore};
use crate::config::{AffinityConfig, DEFAULT_AFFINITY_TTL_SECS};

/// Clones share one reconnecting connection, opened on first use.
#[derive(Clone)]
pub struct RedisAffinityStore {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    prefix: String,
    ttl_seconds: u64,
}

impl std::fmt::Debug for RedisAffinityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAffinityStore")
            .field("prefix", &self.prefix)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisAffinityStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, AffinityError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            connection: Arc::new(OnceCell::new()),
            prefix: "relay".to_string(),
            ttl_seconds: DEFAULT_AFFINITY_TTL_SECS,
        })
    }

    /// Builds a store from `[affinity]`; a configured password replaces any in the URL.
    pub fn from_config(config: &AffinityConfig) -> Result<Self, AffinityError> {
        let raw = config
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AffinityError::Config("affinity.url is not set".to_string()))?;

        let url = match config.password.as_deref().filter(|password| !password.is_empty()) {
            Some(password) => {
                let mut parsed = url::Url::parse(raw)
                    .map_err(|err| AffinityError::Config(format!("invalid affinity.url: {err}")))?;
                parsed.set_password(Some(password)).map_err(|_| {
                    AffinityError::Config("affinity.url cannot carry a password".to_string())
                })?;
                parsed.to_string()
            }
            None => raw.to_string(),
        };

        Ok(Self::new(url)?
            .with_prefix(config.key_prefix.clone())
            .with_ttl_seconds(config.ttl_seconds))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        let manager = self
            .connection
            .get_or_try_init(|| self.client.get_connection_manager())
            .await?;
        Ok(manager.clone())
    }

    fn key_affinity(&self, key: &AffinityKey) -> String {
        format!("{}:affinity:{}:{}", self.prefix, key.kind.as_str(), key.value)
    }
}

#[async_trait]
impl AffinityStore for RedisAffinityStore {
    async fn health_check(&self) -> Result<(), AffinityError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn lookup(&self, keys: &[AffinityKey]) -> Result<Option<String>, AffinityError> {
        if keys.is_empty() {
            return Ok(None);
        }
        let redis_keys = keys
            .iter()
            .map(|key| self.key_affinity(key))
            .collect::<Vec<_>>();
        let mut conn = self.connection().await?;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await?;
        if values.len() != keys.len() {
            return Err(AffinityError::Unavailable(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }
        Ok(values.into_iter().flatten().next())
    }

    async fn record(&self, keys: &[AffinityKey], backend: &str) -> Result<(), AffinityError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("SET")
                .arg(self.key_affinity(key))
                .arg(backend)
                .arg("EX")
                .arg(self.ttl_seconds.max(1))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
