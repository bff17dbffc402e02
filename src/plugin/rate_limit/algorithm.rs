use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::leaky_bucket::LeakyBucket;
use super::storage::{Decision, Storage};
use super::token_bucket::TokenBucket;

/// A rate-limiting discipline over a counting storage. Bucket algorithms
/// keep per-key state of their own and only use the storage indirectly;
/// fixed-window delegates entirely.
#[async_trait]
pub trait Algorithm: Send + Sync {
    async fn allow(
        &self,
        storage: &dyn Storage,
        key: &str,
        limit: i64,
        window: Duration,
        burst: i64,
    ) -> Result<Decision>;
}

/// Map the configured discriminator to a shared instance. Instances must be
/// reused across requests: the bucket algorithms accumulate per-key state
/// that a fresh instance would discard.
pub fn new_algorithm(name: &str) -> Arc<dyn Algorithm> {
    match name {
        "token-bucket" => Arc::new(TokenBucket::new()),
        "leaky-bucket" => Arc::new(LeakyBucket::new()),
        _ => Arc::new(FixedWindow),
    }
}

/// Count-per-window limiting, delegated to the storage so the counter can
/// live in memory or in the shared KV.
pub struct FixedWindow;

#[async_trait]
impl Algorithm for FixedWindow {
    async fn allow(
        &self,
        storage: &dyn Storage,
        key: &str,
        limit: i64,
        window: Duration,
        _burst: i64,
    ) -> Result<Decision> {
        storage.allow(key, limit, window).await
    }
}
