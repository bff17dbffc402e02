use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;

/// Outcome of one counting step.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i64,
    /// When the current window (or bucket) resets.
    pub reset: SystemTime,
}

impl Decision {
    /// Reset moment as Unix seconds, for the X-RateLimit-Reset header.
    pub fn reset_unix(&self) -> i64 {
        self.reset
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Whole seconds until reset, rounded up, never negative.
    pub fn retry_after(&self) -> i64 {
        match self.reset.duration_since(SystemTime::now()) {
            Ok(until) => until.as_secs_f64().ceil() as i64,
            Err(_) => 0,
        }
    }
}

/// Atomic fixed-window counting per key. Implementations decide where the
/// counter lives; the algorithm layer decides how it is consulted.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn allow(&self, key: &str, limit: i64, window: Duration) -> Result<Decision>;

    async fn reset(&self, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up_and_clamps() {
        let ahead = Decision {
            allowed: false,
            remaining: 0,
            reset: SystemTime::now() + Duration::from_millis(1500),
        };
        assert_eq!(ahead.retry_after(), 2);

        let behind = Decision {
            allowed: true,
            remaining: 1,
            reset: SystemTime::now() - Duration::from_secs(5),
        };
        assert_eq!(behind.retry_after(), 0);
    }
}
