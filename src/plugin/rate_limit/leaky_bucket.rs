use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::algorithm::Algorithm;
use super::storage::{Decision, Storage};

struct BucketState {
    level: f64,
    last_update: Instant,
}

/// Leaky bucket: each request pours one unit in, the bucket drains at
/// `limit / window` per second, and a request that would overflow `limit`
/// is rejected. Unlike the token bucket there is no burst headroom.
///
/// State is process-local even when the configured storage is remote.
pub struct LeakyBucket {
    states: DashMap<String, Arc<Mutex<BucketState>>>,
}

impl LeakyBucket {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

// Absorbs float drift when the level sits exactly at the brim.
const EPSILON: f64 = 0.0001;

#[async_trait]
impl Algorithm for LeakyBucket {
    async fn allow(
        &self,
        _storage: &dyn Storage,
        key: &str,
        limit: i64,
        window: Duration,
        _burst: i64,
    ) -> Result<Decision> {
        let leak_rate = limit as f64 / window.as_secs_f64();

        let state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(BucketState {
                    level: 0.0,
                    last_update: Instant::now(),
                }))
            })
            .clone();

        let mut state = state.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.level = (state.level - leak_rate * elapsed).max(0.0);
        state.last_update = now;

        if state.level + 1.0 > limit as f64 + EPSILON {
            let until_space = (state.level + 1.0 - limit as f64) / leak_rate;
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset: SystemTime::now() + Duration::from_secs_f64(until_space.max(0.0)),
            });
        }

        state.level += 1.0;

        let until_empty = state.level / leak_rate;
        Ok(Decision {
            allowed: true,
            remaining: ((limit as f64 - state.level) as i64).max(0),
            reset: SystemTime::now() + Duration::from_secs_f64(until_empty),
        })
    }
}
