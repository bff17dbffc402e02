use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::storage::{Decision, Storage};

struct Entry {
    count: i64,
    reset: SystemTime,
}

/// In-process fixed-window counters. The map entry resolves the
/// create-or-reuse race (concurrent first observers share one entry) and
/// the per-entry lock makes each counting step atomic, so exactly `limit`
/// of N simultaneous requests pass in one window. A janitor evicts expired
/// entries once a minute.
pub struct MemoryStorage {
    entries: DashMap<String, Arc<Mutex<Entry>>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        let storage = Arc::new(Self {
            entries: DashMap::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweeper = Arc::downgrade(&storage);
            handle.spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let Some(storage) = sweeper.upgrade() else {
                        return;
                    };
                    let now = SystemTime::now();
                    storage.entries.retain(|_, entry| entry.lock().reset > now);
                }
            });
        }

        storage
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<Decision> {
        let now = SystemTime::now();

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Entry {
                    count: 0,
                    reset: now + window,
                }))
            })
            .clone();

        let mut entry = entry.lock();

        if now > entry.reset {
            entry.count = 0;
            entry.reset = now + window;
        }

        if entry.count >= limit {
            return Ok(Decision {
                allowed: false,
                remaining: 0,
                reset: entry.reset,
            });
        }

        entry.count += 1;
        Ok(Decision {
            allowed: true,
            remaining: (limit - entry.count).max(0),
            reset: entry.reset,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
