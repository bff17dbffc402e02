use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::{debug, warn};

/// Narrow get/set-with-ttl interface behind the route-decision cache. The
/// cache is best-effort: lookups and writes may silently fail and callers
/// recompute the value.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
}

/// In-process TTL cache. Entries expire lazily on read; a janitor sweeps
/// leftovers once a minute so keys that are never read again do not pile up.
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> std::sync::Arc<Self> {
        let cache = std::sync::Arc::new(Self {
            entries: DashMap::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweeper = std::sync::Arc::downgrade(&cache);
            handle.spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let Some(cache) = sweeper.upgrade() else {
                        return;
                    };
                    let now = Instant::now();
                    cache.entries.retain(|_, (_, deadline)| *deadline > now);
                }
            });
        }

        cache
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (value, deadline) = entry.value();
        if *deadline <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }
}

/// Remote KV cache over a shared redis connection. All keys carry the
/// configured prefix.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisCache {
    pub fn new(conn: redis::aio::ConnectionManager, prefix: String) -> Self {
        Self { conn, prefix }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(self.key(key)).await {
            Ok(value) => value,
            Err(err) => {
                debug!(key = %key, error = %err, "cache read failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        if let Err(err) = conn
            .set_ex::<_, _, ()>(self.key(key), value, seconds)
            .await
        {
            warn!(key = %key, error = %err, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new();
        cache.set("match.path:/api", "0", Duration::from_secs(60)).await;
        assert_eq!(cache.get("match.path:/api").await.as_deref(), Some("0"));
        assert_eq!(cache.get("match.path:/other").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_expires() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_memory_cache_overwrite() {
        let cache = MemoryCache::new();
        cache.set("k", "1", Duration::from_secs(60)).await;
        cache.set("k", "2", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("2"));
    }
}
