use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::algorithm::Algorithm;
use super::storage::{Decision, Storage};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: tokens refill at `limit / window` per second up to the
/// capacity (`burst` when positive, else `limit`); each request spends one.
/// Burst is the instantaneous ceiling, `limit / window` the steady rate.
///
/// State is process-local even when the configured storage is remote:
/// correctness depends on monotonic elapsed time measured by one process.
pub struct TokenBucket {
    states: DashMap<String, Arc<Mutex<BucketState>>>,
}

impl TokenBucket {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

#[async_trait]
impl Algorithm for TokenBucket {
    async fn allow(
        &self,
        _storage: &dyn Storage,
        key: &str,
        limit: i64,
        window: Duration,
        burst: i64,
    ) -> Result<Decision> {
        let capacity = if burst > 0 { burst } else { limit } as f64;
        let refill_rate = limit as f64 / window.as_secs_f64();

        let state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| {
                // A fresh key starts with a full bucket.
                Arc::new(Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                }))
            })
            .clone();

        let mut state = state.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + refill_rate * elapsed).min(capacity);
        state.last_refill = now;

        if state.tokens < 1.0 {
            let until_token = (1.0 - state.tokens) / refill_rate;
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset: SystemTime::now() + Duration::from_secs_f64(until_token),
            });
        }

        state.tokens -= 1.0;

        let until_full = (capacity - state.tokens) / refill_rate;
        Ok(Decision {
            allowed: true,
            remaining: (state.tokens as i64).max(0),
            reset: SystemTime::now() + Duration::from_secs_f64(until_full),
        })
    }
}
