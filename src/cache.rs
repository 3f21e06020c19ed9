// Explanation cache. Keys are content addressed, values are the full
// generated text, entries expire after the configured TTL.

use async_trait::async_trait;
use md5::{Digest, Md5};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::CacheError;

pub const KEY_PREFIX: &str = "gemini:explanation:";

/// Cache key for a citation: fixed prefix plus the hex MD5 of the exact text.
pub fn cache_key(citation: &str) -> String {
    format!("{}{:x}", KEY_PREFIX, Md5::digest(citation.as_bytes()))
}

#[async_trait]
pub trait ExplanationCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

/// Upper bound on a whole cache operation, connecting included.
pub const REDIS_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis backed cache. The connection is opened on first use so the service
/// starts (and keeps answering) while Redis is down.
pub struct RedisCache {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
            timeout: REDIS_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(1)
                    .set_connection_timeout(self.timeout)
                    .set_response_timeout(self.timeout);
                let manager = self.client.get_connection_manager_with_config(config).await?;
                info!("Connected to redis");
                Ok::<_, CacheError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| CacheError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl ExplanationCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let value: Option<String> = con.get(key).await?;
            Ok(value.filter(|v| !v.is_empty()))
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let _: () = con.set_ex(key, value, ttl.as_secs()).await?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Process-local cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ExplanationCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        match entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                debug!(key, "expired entry dropped");
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) if !value.is_empty() => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        debug!(key, entries = entries.len(), "stored in memory");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::closed_port;

    #[test]
    fn key_is_prefixed_md5_hex() {
        let key = cache_key("@inproceedings{x,}");
        let hash = key.strip_prefix(KEY_PREFIX).unwrap();
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // md5("") is a well known constant
        assert_eq!(cache_key(""), "gemini:explanation:d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn key_depends_on_exact_text() {
        let a = "@article{k, title = {Attention Is All You Need}}";
        assert_eq!(cache_key(a), cache_key(a));
        assert_ne!(cache_key(a), cache_key(&format!("{a} ")));
        assert_ne!(cache_key(a), cache_key(&a.replace(", ", ",")));
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "## Summary", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("## Summary"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("k", "text", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn empty_values_read_as_misses() {
        let cache = MemoryCache::new();
        cache.set("k", "", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn storing_sweeps_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("a", "old", Duration::from_millis(10)).await.unwrap();
        cache.set("b", "old", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.set("c", "new", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn unreachable_redis_fails_fast() {
        let url = closed_port().await.replace("http://", "redis://");
        let cache = RedisCache::new(&url)
            .unwrap()
            .with_timeout(Duration::from_millis(500));

        for _ in 0..2 {
            let started = Instant::now();
            assert!(cache.get("k").await.is_err());
            assert!(cache.set("k", "v", Duration::from_secs(60)).await.is_err());
            assert!(started.elapsed() < Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn hung_redis_times_out() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("redis://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let cache = RedisCache::new(&url)
            .unwrap()
            .with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        assert!(cache.get("k").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn redis_url_is_validated_without_connecting() {
        assert!(RedisCache::new("redis://127.0.0.1:6379").is_ok());
        assert!(RedisCache::new("not a url").is_err());
    }
}
