//! Stateful-response affinity: which backend holds the state a request refers to.

#[cfg(feature = "affinity-redis")]
mod redis_store;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::classify::conversation_id;
use crate::config::DEFAULT_AFFINITY_TTL_SECS;
use crate::request::RequestEnvelope;

#[cfg(feature = "affinity-redis")]
pub use redis_store::RedisAffinityStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AffinityKeyKind {
    ResponseId,
    ConversationId,
}

impl AffinityKeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResponseId => "response",
            Self::ConversationId => "conversation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffinityKey {
    pub kind: AffinityKeyKind,
    pub value: String,
}

impl AffinityKey {
    pub fn response(value: impl Into<String>) -> Self {
        Self {
            kind: AffinityKeyKind::ResponseId,
            value: value.into(),
        }
    }

    pub fn conversation(value: impl Into<String>) -> Self {
        Self {
            kind: AffinityKeyKind::ConversationId,
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AffinityError {
    #[cfg(feature = "affinity-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("affinity store misconfigured: {0}")]
    Config(String),
    #[error("affinity store unavailable: {0}")]
    Unavailable(String),
}

/// Keys a stateful request is bound by: `previous_response_id`, a response id in the
/// path (`/responses/{id}`), and the `conversation` it continues.
pub fn collect_affinity_keys(envelope: &RequestEnvelope) -> Vec<AffinityKey> {
    let mut keys = Vec::new();
    let body = envelope.body.as_ref();

    if let Some(id) = body
        .and_then(|body| body.get("previous_response_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        keys.push(AffinityKey::response(id));
    }

    if let Some((_, rest)) = envelope.path.split_once("/responses/") {
        let id = rest.split(['/', '?']).next().unwrap_or_default().trim();
        if !id.is_empty() {
            keys.push(AffinityKey::response(id));
        }
    }

    if let Some(conversation) = body.and_then(conversation_id) {
        keys.push(AffinityKey::conversation(conversation));
    }

    dedup_in_order(keys)
}

/// The request's keys plus the ids the backend just produced.
pub fn write_back_keys(
    request_keys: &[AffinityKey],
    response_id: Option<&str>,
    conversation: Option<&str>,
) -> Vec<AffinityKey> {
    let mut keys = request_keys.to_vec();
    if let Some(id) = response_id.map(str::trim).filter(|id| !id.is_empty()) {
        keys.push(AffinityKey::response(id));
    }
    if let Some(id) = conversation.map(str::trim).filter(|id| !id.is_empty()) {
        keys.push(AffinityKey::conversation(id));
    }
    dedup_in_order(keys)
}

fn dedup_in_order(keys: Vec<AffinityKey>) -> Vec<AffinityKey> {
    let mut out: Vec<AffinityKey> = Vec::with_capacity(keys.len());
    for key in keys {
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

#[async_trait]
pub trait AffinityStore: Send + Sync {
    /// Fails when the store cannot currently answer lookups.
    async fn health_check(&self) -> Result<(), AffinityError>;

    /// The backend recorded for the first key (in the given order) that has one.
    async fn lookup(&self, keys: &[AffinityKey]) -> Result<Option<String>, AffinityError>;

    /// Binds every key to `backend`, refreshing the TTL.
    async fn record(&self, keys: &[AffinityKey], backend: &str) -> Result<(), AffinityError>;
}

/// In-process store for tests and single-instance deployments.
#[derive(Debug)]
pub struct MemoryAffinityStore {
    ttl: Duration,
    entries: Mutex<HashMap<AffinityKey, (String, Instant)>>,
}

impl Default for MemoryAffinityStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_AFFINITY_TTL_SECS))
    }
}

impl MemoryAffinityStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &AffinityKey) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(backend, _)| backend.clone())
    }

    pub fn insert(&self, key: AffinityKey, backend: impl Into<String>) {
        let expires_at = Instant::now() + self.ttl;
        self.lock().insert(key, (backend.into(), expires_at));
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AffinityKey, (String, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AffinityStore for MemoryAffinityStore {
    async fn health_check(&self) -> Result<(), AffinityError> {
        Ok(())
    }

    async fn lookup(&self, keys: &[AffinityKey]) -> Result<Option<String>, AffinityError> {
        Ok(keys.iter().find_map(|key| self.get(key)))
    }

    async fn record(&self, keys: &[AffinityKey], backend: &str) -> Result<(), AffinityError> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        for key in keys {
            entries.insert(key.clone(), (backend.to_string(), now + self.ttl));
        }
        Ok(())
    }
}
