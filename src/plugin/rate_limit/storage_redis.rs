use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use super::storage::{Decision, Storage};

/// Both the count and the absolute reset moment are stored, so a window
/// survives gateway restarts as a true fixed window rather than sliding
/// forward on every write.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    count: i64,
    /// Window reset moment, Unix milliseconds.
    reset_ms: i64,
}

/// Fixed-window counters in a shared redis, for limits enforced across
/// gateway replicas. Reads and writes are separate commands, so heavy
/// contention can admit slightly more than `limit`; it never admits less.
pub struct RedisStorage {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisStorage {
    pub fn new(conn: redis::aio::ConnectionManager, prefix: String) -> Self {
        Self { conn, prefix }
    }

    fn key(&self, key: &str) -> String {
        format!("{}ratelimit:{}", self.prefix, key)
    }
}

fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn from_unix_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

#[async_trait]
impl Storage for RedisStorage {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<Decision> {
        let now = SystemTime::now();
        let redis_key = self.key(key);
        let mut conn = self.conn.clone();

        let stored: Option<String> = conn
            .get(&redis_key)
            .await
            .context("rate limit read failed")?;

        let entry = stored.and_then(|raw| serde_json::from_str::<StoredEntry>(&raw).ok());

        // Fresh key or expired window: open a new window with count 1.
        let entry = match entry {
            Some(entry) if from_unix_ms(entry.reset_ms) > now => entry,
            _ => {
                let fresh = StoredEntry {
                    count: 1,
                    reset_ms: unix_ms(now + window),
                };
                let raw = serde_json::to_string(&fresh)?;
                conn.set_ex::<_, _, ()>(&redis_key, raw, window.as_secs().max(1))
                    .await
                    .context("rate limit write failed")?;
                return Ok(Decision {
                    allowed: true,
                    remaining: (limit - 1).max(0),
                    reset: from_unix_ms(fresh.reset_ms),
                });
            }
        };

        let reset = from_unix_ms(entry.reset_ms);

        if entry.count >= limit {
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset,
            });
        }

        // Keep the absolute reset: the TTL shrinks to the remainder of the
        // window, never stretching back out to the full window.
        let updated = StoredEntry {
            count: entry.count + 1,
            reset_ms: entry.reset_ms,
        };
        let ttl = reset
            .duration_since(now)
            .unwrap_or(Duration::from_secs(1))
            .min(window);
        let raw = serde_json::to_string(&updated)?;
        conn.set_ex::<_, _, ()>(&redis_key, raw, ttl.as_secs().max(1))
            .await
            .context("rate limit write failed")?;

        Ok(Decision {
            allowed: true,
            remaining: (limit - updated.count).max(0),
            reset,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key))
            .await
            .context("rate limit delete failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_entry_round_trip() {
        let entry = StoredEntry {
            count: 7,
            reset_ms: 1_700_000_000_123,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        let parsed: StoredEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.count, 7);
        assert_eq!(parsed.reset_ms, 1_700_000_000_123);
    }

    #[test]
    fn test_unix_ms_round_trip() {
        let now = SystemTime::now();
        let ms = unix_ms(now);
        let back = from_unix_ms(ms);
        let diff = now
            .duration_since(back)
            .unwrap_or_else(|e| e.duration())
            .as_millis();
        assert!(diff < 2);
    }
}
