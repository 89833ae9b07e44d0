//! Cache backends for search responses.
//!
//! Keys for one document share the [`document_prefix`], so everything derived from a document
//! can be purged without knowing the individual fingerprints.

use crate::error::BackendError;
use crate::text::{id_digest, is_plain_id};
use crate::traits::Cache;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const KEY_NAMESPACE: &str = "search:";

/// Key prefix shared by every cached search of `document_id`. Ids that are not plain are
/// replaced by their digest behind a `=` marker, so no prefix ever covers a second document.
pub fn document_prefix(document_id: &str) -> String {
    if is_plain_id(document_id) {
        format!("{KEY_NAMESPACE}{document_id}:")
    } else {
        format!("{KEY_NAMESPACE}={}:", id_digest(document_id))
    }
}

/// Removes every cached entry derived from `document_id`. Cache failures are logged and
/// reported as zero removals.
pub async fn purge_document(cache: &dyn Cache, document_id: &str) -> usize {
    match cache.delete_prefix(&document_prefix(document_id)).await {
        Ok(removed) => {
            debug!(document_id, removed, "search cache purged");
            removed
        }
        Err(error) => {
            warn!(document_id, error = %error, "search cache purge failed");
            0
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local TTL cache. Expired entries read as absent and are dropped on the next write.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}

/// Redis-backed cache. Values are stored with `SET EX`; prefix purges use `KEYS` + `DEL`.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(
            url = %url.replace(|ch: char| ch.is_ascii_alphanumeric(), "*"),
            "redis search cache connected"
        );
        Ok(Self { connection })
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut connection = self.connection.clone();
        Ok(connection.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        let seconds = ttl.as_secs().max(1);
        connection.set_ex::<_, _, ()>(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut connection = self.connection.clone();
        let removed: i64 = connection.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut connection = self.connection.clone();
        Ok(connection.exists::<_, bool>(key).await?)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut connection = self.connection.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut connection)
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: i64 = connection.del(&keys[..]).await?;
        Ok(removed.max(0) as usize)
    }
}
